/// Low-level SSA IR
///
/// Module layout:
///   - oper — operands, arena ids, structured global data
///   - inst — instruction kinds and the def/use slots
///   - cfg  — DFS traversals, dominators, dominance frontier
///   - ssa  — phi insertion, renaming, pruning
///   - opt  — copy propagation, dead-allocation and null-check
///            elimination
///
/// A `Module` maps names to functions (text), global constants
/// (rodata) and global variables (data). Each `Function` owns arenas
/// of operands, instructions and blocks; `IRBuilder` appends
/// instructions to a current block and hands back fresh result
/// operands, folding constant expressions as it goes.

pub mod cfg;
pub mod inst;
pub mod oper;
pub mod opt;
pub mod ssa;

pub use inst::{BinaryKind, Inst, InstKind, UnaryKind};
pub use oper::{
    BlockId, FuncId, GlobalInit, InstId, OperId, Operand, OperandKind, OperandType,
    StructuredData,
};

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Written back by post-order traversals; -1 before the first one.
    pub postorder: i32,
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Function {
    name: String,
    params: Vec<OperId>,
    return_type: OperandType,
    opers: Vec<Operand>,
    insts: Vec<Inst>,
    blocks: Vec<Block>,
    cfg_root: Option<BlockId>,
    is_leaf: bool,
    next_tmp: u32,
}

impl Function {
    fn new(name: impl Into<String>, params: &[(String, OperandType)], ret: OperandType) -> Self {
        let mut func = Function {
            name: name.into(),
            params: Vec::new(),
            return_type: ret,
            opers: Vec::new(),
            insts: Vec::new(),
            blocks: Vec::new(),
            cfg_root: None,
            is_leaf: false,
            next_tmp: 0,
        };
        let param_opers: Vec<OperId> =
            params.iter().map(|(n, ty)| func.var(n, *ty)).collect();
        func.params = param_opers;
        func
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> OperandType {
        self.return_type
    }

    pub fn has_return(&self) -> bool {
        self.return_type != OperandType::Void
    }

    pub fn params(&self) -> &[OperId] {
        &self.params
    }

    pub fn param(&self, i: usize) -> OperId {
        self.params[i]
    }

    pub fn set_param(&mut self, i: usize, oper: OperId) {
        self.params[i] = oper;
    }

    pub fn set_is_leaf(&mut self) {
        self.is_leaf = true;
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    // -- operand arena ------------------------------------------------------

    fn new_oper(&mut self, kind: OperandKind, ty: OperandType) -> OperId {
        let id = OperId(self.opers.len() as u32);
        self.opers.push(Operand { kind, ty, uses: Vec::new(), defs: Vec::new() });
        id
    }

    pub fn var(&mut self, name: &str, ty: OperandType) -> OperId {
        self.new_oper(
            OperandKind::Variable { name: name.to_string(), version: None, original: None },
            ty,
        )
    }

    /// Fresh compiler temporary `tmp<N>`.
    pub fn temp(&mut self, ty: OperandType) -> OperId {
        let name = format!("tmp{}", self.next_tmp);
        self.next_tmp += 1;
        self.var(&name, ty)
    }

    /// A renamed SSA version of `original`.
    pub fn version_of(&mut self, original: OperId, version: u32) -> OperId {
        let (name, root) = match &self.opers[original.index()].kind {
            OperandKind::Variable { name, original: orig, .. } => {
                (name.clone(), orig.unwrap_or(original))
            }
            _ => panic!("only variables can be versioned"),
        };
        let ty = self.opers[original.index()].ty;
        self.new_oper(
            OperandKind::Variable { name, version: Some(version), original: Some(root) },
            ty,
        )
    }

    pub fn constant(&mut self, value: i64, ty: OperandType) -> OperId {
        self.new_oper(OperandKind::Constant(value), ty)
    }

    /// Reference to a module-level symbol.
    pub fn global(&mut self, name: &str, ty: OperandType) -> OperId {
        self.new_oper(OperandKind::Global { name: name.to_string() }, ty)
    }

    pub fn oper(&self, id: OperId) -> &Operand {
        &self.opers[id.index()]
    }

    pub fn oper_mut(&mut self, id: OperId) -> &mut Operand {
        &mut self.opers[id.index()]
    }

    pub fn opers_len(&self) -> usize {
        self.opers.len()
    }

    /// The unique defining instruction, if any.
    pub fn def_of(&self, id: OperId) -> Option<InstId> {
        self.opers[id.index()].defs.first().copied()
    }

    // -- instruction arena --------------------------------------------------

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    fn create_inst(&mut self, kind: InstKind, def: Option<OperId>, uses: Vec<OperId>) -> InstId {
        let id = InstId(self.insts.len() as u32);
        for &use_id in &uses {
            self.opers[use_id.index()].uses.push(id);
        }
        if let Some(def_id) = def {
            self.opers[def_id.index()].defs.push(id);
        }
        self.insts.push(Inst { kind, def, uses, block: None });
        id
    }

    pub fn append(&mut self, block: BlockId, kind: InstKind, def: Option<OperId>, uses: Vec<OperId>) -> InstId {
        let id = self.create_inst(kind, def, uses);
        self.insts[id.index()].block = Some(block);
        self.blocks[block.index()].insts.push(id);
        id
    }

    pub fn append_front(&mut self, block: BlockId, kind: InstKind, def: Option<OperId>, uses: Vec<OperId>) -> InstId {
        let id = self.create_inst(kind, def, uses);
        self.insts[id.index()].block = Some(block);
        self.blocks[block.index()].insts.insert(0, id);
        id
    }

    /// Remove an instruction from its block and from every use-def
    /// chain. The arena slot stays behind as a tombstone.
    pub fn erase(&mut self, id: InstId) {
        let block = self.insts[id.index()].block.take();
        if let Some(block) = block {
            self.blocks[block.index()].insts.retain(|&i| i != id);
        }

        let uses = std::mem::take(&mut self.insts[id.index()].uses);
        for use_id in uses {
            if let Some(pos) = self.opers[use_id.index()].uses.iter().position(|&i| i == id) {
                self.opers[use_id.index()].uses.remove(pos);
            }
        }
        if let Some(def) = self.insts[id.index()].def.take() {
            self.opers[def.index()].defs.retain(|&i| i != id);
        }
        if let InstKind::Phi { paths } = &mut self.insts[id.index()].kind {
            paths.clear();
        }
    }

    /// Rewrite every occurrence of `old` in the instruction's use list
    /// (and phi paths) to `new`, maintaining both chains.
    pub fn update_use(&mut self, inst: InstId, old: OperId, new: OperId) {
        let mut replaced = 0;
        for use_slot in &mut self.insts[inst.index()].uses {
            if *use_slot == old {
                *use_slot = new;
                replaced += 1;
            }
        }
        if let InstKind::Phi { paths } = &mut self.insts[inst.index()].kind {
            for (_, oper) in paths.iter_mut() {
                if *oper == old {
                    *oper = new;
                }
            }
        }
        for _ in 0..replaced {
            if let Some(pos) = self.opers[old.index()].uses.iter().position(|&i| i == inst) {
                self.opers[old.index()].uses.remove(pos);
            }
            self.opers[new.index()].uses.push(inst);
        }
    }

    pub fn update_def(&mut self, inst: InstId, new: OperId) {
        if let Some(old) = self.insts[inst.index()].def {
            self.opers[old.index()].defs.retain(|&i| i != inst);
        }
        self.insts[inst.index()].def = Some(new);
        self.opers[new.index()].defs.push(inst);
    }

    /// Insert an (empty) phi for `var` at the top of `block`.
    pub fn insert_phi(&mut self, var: OperId, block: BlockId) -> InstId {
        self.append_front(block, InstKind::Phi { paths: Vec::new() }, Some(var), Vec::new())
    }

    /// Record that `oper` flows into the phi from `pred`.
    pub fn phi_add_path(&mut self, phi: InstId, oper: OperId, pred: BlockId) {
        match &mut self.insts[phi.index()].kind {
            InstKind::Phi { paths } => paths.push((pred, oper)),
            _ => panic!("phi_add_path on non-phi"),
        }
        self.insts[phi.index()].uses.push(oper);
        self.opers[oper.index()].uses.push(phi);
    }

    // -- blocks and edges ---------------------------------------------------

    pub fn new_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            name: name.to_string(),
            insts: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            postorder: -1,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    pub fn connect(&mut self, pred: BlockId, succ: BlockId) {
        self.blocks[pred.index()].succs.push(succ);
        self.blocks[succ.index()].preds.push(pred);
    }

    pub fn disconnect(&mut self, pred: BlockId, succ: BlockId) {
        self.blocks[pred.index()].succs.retain(|&b| b != succ);
        self.blocks[succ.index()].preds.retain(|&b| b != pred);
    }

    pub fn set_cfg(&mut self, root: BlockId) {
        self.cfg_root = Some(root);
    }

    pub fn cfg_root(&self) -> Option<BlockId> {
        self.cfg_root
    }

    // -- debugging ----------------------------------------------------------

    pub fn dump(&self) -> String {
        let mut out = format!("fn {}(", self.name);
        for (i, &p) in self.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.oper(p).name());
        }
        out.push_str(&format!(") -> {} {{\n", self.return_type));

        for (i, block) in self.blocks.iter().enumerate() {
            out.push_str(&format!("{} (id {}):\n", block.name, i));
            for &inst_id in &block.insts {
                out.push_str(&format!("    {}\n", self.dump_inst(inst_id)));
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn dump_inst(&self, id: InstId) -> String {
        let inst = self.inst(id);
        let def = inst.def.map(|d| self.oper(d).name()).unwrap_or_default();
        let use_name = |i: usize| self.oper(inst.uses[i]).name();
        match &inst.kind {
            InstKind::Phi { paths } => {
                let paths = paths
                    .iter()
                    .map(|(b, o)| format!("[{}, {}]", self.block(*b).name, self.oper(*o).name()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{} <- phi {}", def, paths)
            }
            InstKind::Store => format!("st {}[{}], {}", use_name(0), use_name(1), use_name(2)),
            InstKind::Load => format!("{} <- ld {}[{}]", def, use_name(0), use_name(1)),
            InstKind::Branch { target } => format!("br {}", self.block(*target).name),
            InstKind::CondBranch { taken, not_taken } => format!(
                "condbr {}, {}, {}",
                use_name(0),
                self.block(*taken).name,
                self.block(*not_taken).name
            ),
            InstKind::Binary(op) => {
                format!("{} <- {} {} {}", def, use_name(0), op.symbol(), use_name(1))
            }
            InstKind::Unary(UnaryKind::Neg) => format!("{} <- neg {}", def, use_name(0)),
            InstKind::Unary(UnaryKind::Not) => format!("{} <- not {}", def, use_name(0)),
            InstKind::Move => format!("{} <- move {}", def, use_name(0)),
            InstKind::Call { callee } => {
                let args = (0..inst.uses.len()).map(use_name).collect::<Vec<_>>().join(", ");
                let callee = callee.index();
                if def.is_empty() {
                    format!("call #{}({})", callee, args)
                } else {
                    format!("{} <- call #{}({})", def, callee, args)
                }
            }
            InstKind::Ret => {
                if inst.uses.is_empty() {
                    "ret".to_string()
                } else {
                    format!("ret {}", use_name(0))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Module {
    funcs: Vec<Function>,
    func_index: HashMap<String, FuncId>,
    constants: Vec<StructuredData>,
    const_index: HashMap<String, usize>,
    variables: Vec<StructuredData>,
    var_index: HashMap<String, usize>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn declare_function(
        &mut self,
        name: &str,
        params: &[(String, OperandType)],
        ret: OperandType,
    ) -> FuncId {
        debug_assert!(!self.func_index.contains_key(name), "function redeclared: {}", name);
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(Function::new(name, params, ret));
        self.func_index.insert(name.to_string(), id);
        id
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id.index()]
    }

    pub fn func_id(&self, name: &str) -> Option<FuncId> {
        self.func_index.get(name).copied()
    }

    pub fn funcs(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.funcs.iter().enumerate().map(|(i, f)| (FuncId(i as u32), f))
    }

    pub fn funcs_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.funcs.iter_mut()
    }

    pub fn add_constant(&mut self, data: StructuredData) {
        self.const_index.insert(data.name.clone(), self.constants.len());
        self.constants.push(data);
    }

    pub fn add_variable(&mut self, data: StructuredData) {
        self.var_index.insert(data.name.clone(), self.variables.len());
        self.variables.push(data);
    }

    pub fn constant_data(&self, name: &str) -> Option<&StructuredData> {
        self.const_index.get(name).map(|&i| &self.constants[i])
    }

    pub fn variable_data(&self, name: &str) -> Option<&StructuredData> {
        self.var_index.get(name).map(|&i| &self.variables[i])
    }

    /// Constants in emission order.
    pub fn constants(&self) -> &[StructuredData] {
        &self.constants
    }

    pub fn variables(&self) -> &[StructuredData] {
        &self.variables
    }
}

// ---------------------------------------------------------------------------
// IRBuilder
// ---------------------------------------------------------------------------

/// Carries the "current block" cursor; every convenience method
/// appends to it and returns the fresh result operand.
pub struct IRBuilder<'m> {
    module: &'m mut Module,
    func: FuncId,
    curr_block: Option<BlockId>,
}

impl<'m> IRBuilder<'m> {
    pub fn new(module: &'m mut Module, func: FuncId) -> Self {
        IRBuilder { module, func, curr_block: None }
    }

    pub fn func(&self) -> &Function {
        self.module.func(self.func)
    }

    pub fn func_mut(&mut self) -> &mut Function {
        self.module.func_mut(self.func)
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    pub fn new_block(&mut self, name: &str) -> BlockId {
        self.func_mut().new_block(name)
    }

    pub fn set_current_block(&mut self, block: BlockId) {
        self.curr_block = Some(block);
    }

    pub fn curr_block(&self) -> BlockId {
        self.curr_block.expect("no current block")
    }

    pub fn field_offset(&mut self, offset: usize) -> OperId {
        self.func_mut().constant(offset as i64, OperandType::UInt64)
    }

    fn append(&mut self, kind: InstKind, def: Option<OperId>, uses: Vec<OperId>) -> InstId {
        let block = self.curr_block();
        self.func_mut().append(block, kind, def, uses)
    }

    // -- terminators --------------------------------------------------------

    pub fn ret(&mut self, value: Option<OperId>) {
        let uses = value.into_iter().collect();
        self.append(InstKind::Ret, None, uses);
    }

    pub fn br(&mut self, target: BlockId) {
        let block = self.curr_block();
        self.append(InstKind::Branch { target }, None, Vec::new());
        self.func_mut().connect(block, target);
    }

    pub fn cond_br(&mut self, cond: OperId, taken: BlockId, not_taken: BlockId) {
        let block = self.curr_block();
        self.append(InstKind::CondBranch { taken, not_taken }, None, vec![cond]);
        self.func_mut().connect(block, taken);
        self.func_mut().connect(block, not_taken);
    }

    // -- memory -------------------------------------------------------------

    pub fn st(&mut self, base: OperId, offset: OperId, value: OperId) {
        self.append(InstKind::Store, None, vec![base, offset, value]);
    }

    /// Load, folded when the base is a global constant and the offset
    /// is a constant: the corresponding field of the structured data
    /// becomes the result.
    pub fn ld(&mut self, ty: OperandType, base: OperId, offset: OperId) -> OperId {
        let folded = {
            let func = self.module.func(self.func);
            match (&func.oper(base).kind, func.oper(offset).constant_value()) {
                (OperandKind::Global { name }, Some(off)) => self
                    .module
                    .constant_data(name)
                    .and_then(|data| data.field_at_offset(off as usize))
                    .cloned(),
                _ => None,
            }
        };

        match folded {
            Some(GlobalInit::Int(value, int_ty)) => self.func_mut().constant(value, int_ty),
            Some(GlobalInit::Label(label)) => self.func_mut().global(&label, OperandType::Pointer),
            _ => {
                let def = self.func_mut().temp(ty);
                self.append(InstKind::Load, Some(def), vec![base, offset]);
                def
            }
        }
    }

    // -- calls --------------------------------------------------------------

    pub fn call(&mut self, callee: FuncId, args: Vec<OperId>) -> Option<OperId> {
        let ret = self.module.func(callee).return_type();
        let def = if ret == OperandType::Void {
            None
        } else {
            Some(self.func_mut().temp(ret))
        };
        self.append(InstKind::Call { callee }, def, args);
        def
    }

    // -- arithmetic and logic -----------------------------------------------

    fn binary(&mut self, op: BinaryKind, lhs: OperId, rhs: OperId) -> OperId {
        let (lhs_const, rhs_const, lhs_ty) = {
            let func = self.module.func(self.func);
            (
                func.oper(lhs).constant_value(),
                func.oper(rhs).constant_value(),
                func.oper(lhs).ty,
            )
        };

        if let (Some(l), Some(r)) = (lhs_const, rhs_const) {
            if let Some(folded) = op.fold(l, r) {
                return self.func_mut().constant(folded, lhs_ty);
            }
        }

        let def = self.func_mut().temp(lhs_ty);
        self.append(InstKind::Binary(op), Some(def), vec![lhs, rhs]);
        def
    }

    fn unary(&mut self, op: UnaryKind, operand: OperId) -> OperId {
        let (const_val, ty) = {
            let func = self.module.func(self.func);
            (func.oper(operand).constant_value(), func.oper(operand).ty)
        };

        if let Some(v) = const_val {
            return self.func_mut().constant(op.fold(v), ty);
        }

        let def = self.func_mut().temp(ty);
        self.append(InstKind::Unary(op), Some(def), vec![operand]);
        def
    }

    pub fn add(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Div, lhs, rhs)
    }

    pub fn shl(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Shl, lhs, rhs)
    }

    pub fn or2(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Or, lhs, rhs)
    }

    pub fn xor2(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Xor, lhs, rhs)
    }

    pub fn lt(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Lt, lhs, rhs)
    }

    pub fn le(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Le, lhs, rhs)
    }

    pub fn eq(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Eq, lhs, rhs)
    }

    pub fn gt(&mut self, lhs: OperId, rhs: OperId) -> OperId {
        self.binary(BinaryKind::Gt, lhs, rhs)
    }

    pub fn neg(&mut self, operand: OperId) -> OperId {
        self.unary(UnaryKind::Neg, operand)
    }

    pub fn not1(&mut self, operand: OperId) -> OperId {
        self.unary(UnaryKind::Not, operand)
    }

    /// Copy into a fresh temporary.
    pub fn move_new(&mut self, src: OperId) -> OperId {
        let ty = self.func().oper(src).ty;
        let def = self.func_mut().temp(ty);
        self.append(InstKind::Move, Some(def), vec![src]);
        def
    }

    /// Copy into an existing destination (renaming and lowering).
    pub fn move_to(&mut self, dst: OperId, src: OperId) {
        self.append(InstKind::Move, Some(dst), vec![src]);
    }
}
