/// Klass registry — per-class layout metadata
///
/// A `Klass` owns the complete field and method layout of one class:
/// inherited fields first with their offsets preserved, then own
/// fields; parent method slots first, overrides replacing the entry
/// in place, new methods appended. The slot index is the dispatch
/// table index. Tags are assigned by a pre-order walk of the class
/// hierarchy starting at 1 (tag 0 marks free heap chunks), and
/// `child_max_tag` closes each subtree so that subclass tests become
/// the interval test `tag(C) <= t <= child_max_tag(C)`.

use crate::ast::{FeatureKind, TypeId, TypeTable};
use crate::runtime::object::{HEADER_SIZE, WORD_SIZE};
use crate::semant::{Analysis, ClassTree};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Symbol names
// ---------------------------------------------------------------------------

/// Name-mangling rules shared with the code emitter.
pub struct Names;

impl Names {
    pub fn prototype(class: &str) -> String {
        format!("{}_protObj", class)
    }

    pub fn disp_table(class: &str) -> String {
        format!("{}_dispTab", class)
    }

    pub fn init_method(class: &str) -> String {
        format!("{}_init", class)
    }

    pub fn method_full_name(class: &str, method: &str, delim: char) -> String {
        format!("{}{}{}", class, delim, method)
    }
}

// ---------------------------------------------------------------------------
// Klass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KlassField {
    pub name: String,
    pub ty: TypeId,
    /// Byte offset from the object base (the header precedes field 0).
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct KlassMethod {
    /// The class whose definition fills this dispatch slot.
    pub defined_in: TypeId,
    pub name: String,
}

#[derive(Debug)]
pub struct Klass {
    name: TypeId,
    parent: Option<TypeId>,
    tag: i32,
    child_max_tag: i32,
    fields: Vec<KlassField>,
    methods: Vec<KlassMethod>,
}

impl Klass {
    pub fn name(&self) -> TypeId {
        self.name
    }

    pub fn parent(&self) -> Option<TypeId> {
        self.parent
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn child_max_tag(&self) -> i32 {
        self.child_max_tag
    }

    /// `tag` belongs to this class or one of its subclasses.
    pub fn covers_tag(&self, tag: i32) -> bool {
        self.tag <= tag && tag <= self.child_max_tag
    }

    pub fn is_leaf(&self) -> bool {
        self.tag == self.child_max_tag
    }

    pub fn fields(&self) -> &[KlassField] {
        &self.fields
    }

    pub fn fields_num(&self) -> usize {
        self.fields.len()
    }

    pub fn field_offset(&self, field_num: usize) -> usize {
        self.fields[field_num].offset
    }

    /// Object size in bytes, header included.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.fields.len() * WORD_SIZE
    }

    pub fn methods(&self) -> &[KlassMethod] {
        &self.methods
    }

    /// Dispatch-table slot of the given method.
    pub fn method_index(&self, method_name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == method_name)
    }

    pub fn method_offset(&self, method_name: &str) -> Option<usize> {
        self.method_index(method_name).map(|i| i * WORD_SIZE)
    }
}

// ---------------------------------------------------------------------------
// KlassBuilder
// ---------------------------------------------------------------------------

pub struct KlassBuilder {
    klasses: HashMap<TypeId, Klass>,
    by_tag: Vec<TypeId>,
}

impl KlassBuilder {
    pub fn new(analysis: &Analysis) -> Self {
        let mut builder = KlassBuilder { klasses: HashMap::new(), by_tag: Vec::new() };
        builder.build_klass(&analysis.tree, analysis.tree.root, 1);

        // klasses sorted by tag for table emission
        let mut by_tag: Vec<TypeId> = builder.klasses.keys().copied().collect();
        by_tag.sort_by_key(|id| builder.klasses[id].tag);
        builder.by_tag = by_tag;

        builder
    }

    /// Pre-order construction: a class's Klass starts from its
    /// parent's layout, then folds in its own features in source
    /// order. Returns the largest tag in the subtree.
    fn build_klass(&mut self, tree: &ClassTree, id: TypeId, tag: i32) -> i32 {
        let class = tree.class(id);

        let (mut fields, mut methods) = match self.klasses.get(&tree.parent(id)) {
            Some(parent) => (parent.fields.clone(), parent.methods.clone()),
            None => (Vec::new(), Vec::new()),
        };

        for feature in &class.features {
            match &feature.kind {
                FeatureKind::Method { .. } => {
                    match methods.iter_mut().find(|m| m.name == feature.name) {
                        Some(slot) => slot.defined_in = id,
                        None => {
                            methods.push(KlassMethod { defined_in: id, name: feature.name.clone() })
                        }
                    }
                }
                FeatureKind::Attribute { .. } => {
                    let offset = HEADER_SIZE + fields.len() * WORD_SIZE;
                    fields.push(KlassField { name: feature.name.clone(), ty: feature.ty, offset });
                }
            }
        }

        self.klasses.insert(
            id,
            Klass {
                name: id,
                parent: if tree.parent(id) == crate::ast::EMPTY {
                    None
                } else {
                    Some(tree.parent(id))
                },
                tag,
                child_max_tag: tag, // patched after the subtree walk
                fields,
                methods,
            },
        );

        let mut child_max_tag = tag;
        for &child in tree.children(id) {
            child_max_tag = self.build_klass(tree, child, child_max_tag + 1);
        }
        self.klasses.get_mut(&id).expect("klass just inserted").child_max_tag = child_max_tag;

        child_max_tag
    }

    pub fn klass(&self, id: TypeId) -> &Klass {
        &self.klasses[&id]
    }

    pub fn tag(&self, id: TypeId) -> i32 {
        self.klasses[&id].tag
    }

    /// Klass ids ordered by tag.
    pub fn klasses(&self) -> impl Iterator<Item = &Klass> {
        self.by_tag.iter().map(move |id| &self.klasses[id])
    }

    pub fn len(&self) -> usize {
        self.klasses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klasses.is_empty()
    }

    pub fn prototype_name(&self, types: &TypeTable, id: TypeId) -> String {
        Names::prototype(types.name(id))
    }

    pub fn disp_table_name(&self, types: &TypeTable, id: TypeId) -> String {
        Names::disp_table(types.name(id))
    }

    pub fn init_name(&self, types: &TypeTable, id: TypeId) -> String {
        Names::init_method(types.name(id))
    }

    /// IR-level symbol `<DefiningClass>.<method>` for a dispatch slot.
    pub fn method_symbol(&self, types: &TypeTable, id: TypeId, slot: usize) -> String {
        let method = &self.klasses[&id].methods[slot];
        Names::method_full_name(types.name(method.defined_in), &method.name, '.')
    }
}
