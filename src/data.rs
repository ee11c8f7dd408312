/// Data segment builder
///
/// Emits, in order: the class-name table, the class-object table
/// (prototype/init pairs), per-class prototype objects, per-class
/// dispatch tables, and deduplicated boolean/integer/string constant
/// pools. Every constant carries a full object header whose mark word
/// is preconfigured so the objects appear marked to the GC and are
/// never moved or freed. Tables index by class tag; entry 0 is null
/// because tag 0 names free memory.

use crate::ast::{TypeId, BOOL, INT, STRING};
use crate::ir::{GlobalInit, Module, OperandType, StructuredData};
use crate::klass::{KlassBuilder, Names};
use crate::runtime::object::{FALSE_VALUE, HEADER_SIZE, MARK_DEFAULT, TRUE_VALUE, WORD_SIZE};
use crate::semant::{is_native_type, Analysis};
use std::collections::HashMap;

pub const CLASS_NAME_TAB: &str = "class_nameTab";
pub const CLASS_OBJ_TAB: &str = "class_objTab";
pub const INT_TAG_NAME: &str = "_int_tag";
pub const BOOL_TAG_NAME: &str = "_bool_tag";
pub const STRING_TAG_NAME: &str = "_string_tag";

pub struct DataBuilder<'a> {
    analysis: &'a Analysis,
    klasses: &'a KlassBuilder,

    int_constants: HashMap<i64, String>,
    bool_constants: HashMap<bool, String>,
    string_constants: HashMap<String, String>,
    next_int: u32,
    next_string: u32,
}

impl<'a> DataBuilder<'a> {
    pub fn new(analysis: &'a Analysis, klasses: &'a KlassBuilder) -> Self {
        DataBuilder {
            analysis,
            klasses,
            int_constants: HashMap::new(),
            bool_constants: HashMap::new(),
            string_constants: HashMap::new(),
            next_int: 0,
            next_string: 0,
        }
    }

    /// Emit all required globals into the module.
    pub fn build(&mut self, module: &mut Module) {
        self.gen_tag_names(module);
        self.gen_class_name_tab(module);
        self.gen_class_obj_tab(module);
    }

    fn class_name(&self, id: TypeId) -> &str {
        self.analysis.types.name(id)
    }

    // -----------------------------------------------------------------------
    // Tables
    // -----------------------------------------------------------------------

    /// The trivial-class tags as named words; the runtime reads them
    /// at startup.
    fn gen_tag_names(&mut self, module: &mut Module) {
        for (name, id) in [
            (INT_TAG_NAME, INT),
            (BOOL_TAG_NAME, BOOL),
            (STRING_TAG_NAME, STRING),
        ] {
            module.add_constant(StructuredData::new(
                name,
                vec![GlobalInit::Int(self.klasses.tag(id) as i64, OperandType::Int32)],
            ));
        }
    }

    /// At index (class tag) a pointer to the String constant holding
    /// the class name.
    fn gen_class_name_tab(&mut self, module: &mut Module) {
        let mut fields = vec![GlobalInit::Int(0, OperandType::Pointer)]; // tag 0 is reserved
        let names: Vec<String> =
            self.klasses.klasses().map(|k| self.class_name(k.name()).to_string()).collect();
        for name in names {
            let label = self.string_const(module, &name);
            fields.push(GlobalInit::Label(label));
        }
        module.add_constant(StructuredData::new(CLASS_NAME_TAB, fields));
    }

    /// At index (class tag) the {prototype, init} pair.
    fn gen_class_obj_tab(&mut self, module: &mut Module) {
        self.gen_prototypes(module);
        self.gen_dispatch_tabs(module);

        let mut fields = vec![
            GlobalInit::Int(0, OperandType::Pointer),
            GlobalInit::Int(0, OperandType::Pointer),
        ];
        for klass in self.klasses.klasses() {
            let name = self.class_name(klass.name());
            fields.push(GlobalInit::Label(Names::prototype(name)));
            fields.push(GlobalInit::Label(Names::init_method(name)));
        }
        module.add_constant(StructuredData::new(CLASS_OBJ_TAB, fields));
    }

    // -----------------------------------------------------------------------
    // Prototypes and dispatch tables
    // -----------------------------------------------------------------------

    fn gen_prototypes(&mut self, module: &mut Module) {
        // defaults referenced by every trivial-typed field
        self.int_const(module, 0);
        self.string_const(module, "");
        self.bool_const(module, false);
        self.bool_const(module, true);

        let ids: Vec<TypeId> = self.klasses.klasses().map(|k| k.name()).collect();
        for id in ids {
            self.class_struct(module, id);
        }
    }

    fn class_struct(&mut self, module: &mut Module, id: TypeId) {
        let klass = self.klasses.klass(id);
        let class_name = self.class_name(id).to_string();

        let mut fields = vec![
            GlobalInit::Int(MARK_DEFAULT as i64, OperandType::UInt64),
            GlobalInit::Int(klass.tag() as i64, OperandType::Int32),
            GlobalInit::Int(klass.size() as i64, OperandType::UInt64),
            GlobalInit::Label(Names::disp_table(&class_name)),
        ];

        let field_types: Vec<TypeId> = klass.fields().iter().map(|f| f.ty).collect();
        for ty in field_types {
            let init = if ty == INT {
                GlobalInit::Label(self.int_const(module, 0))
            } else if ty == BOOL {
                GlobalInit::Label(self.bool_const(module, false))
            } else if ty == STRING {
                GlobalInit::Label(self.string_const(module, ""))
            } else if is_native_type(ty) {
                GlobalInit::Int(0, OperandType::UInt64)
            } else {
                GlobalInit::Int(0, OperandType::Pointer) // void
            };
            fields.push(init);
        }

        module.add_constant(StructuredData::new(Names::prototype(&class_name), fields));
    }

    fn gen_dispatch_tabs(&mut self, module: &mut Module) {
        let ids: Vec<TypeId> = self.klasses.klasses().map(|k| k.name()).collect();
        for id in ids {
            let klass = self.klasses.klass(id);
            let class_name = self.class_name(id).to_string();

            let mut fields = Vec::with_capacity(klass.methods().len());
            for slot in 0..klass.methods().len() {
                fields.push(GlobalInit::Label(self.klasses.method_symbol(
                    &self.analysis.types,
                    id,
                    slot,
                )));
            }
            module.add_constant(StructuredData::new(Names::disp_table(&class_name), fields));
        }
    }

    // -----------------------------------------------------------------------
    // Constant pools (deduplicated)
    // -----------------------------------------------------------------------

    pub fn int_const(&mut self, module: &mut Module, value: i64) -> String {
        if let Some(label) = self.int_constants.get(&value) {
            return label.clone();
        }
        let label = format!("int_const{}", self.next_int);
        self.next_int += 1;

        let int_klass = self.klasses.klass(INT);
        module.add_constant(StructuredData::new(
            label.clone(),
            vec![
                GlobalInit::Int(MARK_DEFAULT as i64, OperandType::UInt64),
                GlobalInit::Int(int_klass.tag() as i64, OperandType::Int32),
                GlobalInit::Int(int_klass.size() as i64, OperandType::UInt64),
                GlobalInit::Label(Names::disp_table(self.class_name(INT))),
                GlobalInit::Int(value, OperandType::Int64),
            ],
        ));
        self.int_constants.insert(value, label.clone());
        label
    }

    pub fn bool_const(&mut self, module: &mut Module, value: bool) -> String {
        if let Some(label) = self.bool_constants.get(&value) {
            return label.clone();
        }
        let label = format!("bool_const{}", value as u32);

        let bool_klass = self.klasses.klass(BOOL);
        module.add_constant(StructuredData::new(
            label.clone(),
            vec![
                GlobalInit::Int(MARK_DEFAULT as i64, OperandType::UInt64),
                GlobalInit::Int(bool_klass.tag() as i64, OperandType::Int32),
                GlobalInit::Int(bool_klass.size() as i64, OperandType::UInt64),
                GlobalInit::Label(Names::disp_table(self.class_name(BOOL))),
                GlobalInit::Int(if value { TRUE_VALUE } else { FALSE_VALUE }, OperandType::Int64),
            ],
        ));
        self.bool_constants.insert(value, label.clone());
        label
    }

    pub fn string_const(&mut self, module: &mut Module, value: &str) -> String {
        if let Some(label) = self.string_constants.get(value) {
            return label.clone();
        }
        let length_label = self.int_const(module, value.len() as i64);

        let label = format!("str_const{}", self.next_string);
        self.next_string += 1;

        let string_klass = self.klasses.klass(STRING);
        // header + length pointer + NUL-terminated bytes, word aligned
        let payload = value.len() + 1;
        let size = HEADER_SIZE + WORD_SIZE + payload.div_ceil(WORD_SIZE) * WORD_SIZE;

        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);

        module.add_constant(StructuredData::new(
            label.clone(),
            vec![
                GlobalInit::Int(MARK_DEFAULT as i64, OperandType::UInt64),
                GlobalInit::Int(string_klass.tag() as i64, OperandType::Int32),
                GlobalInit::Int(size as i64, OperandType::UInt64),
                GlobalInit::Label(Names::disp_table(self.class_name(STRING))),
                GlobalInit::Label(length_label),
                GlobalInit::Bytes(bytes),
            ],
        ));
        self.string_constants.insert(value.to_string(), label.clone());
        label
    }
}
