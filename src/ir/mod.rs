use std::fmt;

use rustc_hash::FxHashMap;

pub mod parser;

pub use parser::{parse, ParseError};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TyId(u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModId(u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl fmt::Debug for TyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl ValueId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Ty {
    Void,
    Int(u32),
    Float(u32),
    Ptr(TyId),
    Array(TyId, u64),
    Struct(Vec<TyId>),
    Func(Vec<TyId>, TyId),
    Opaque,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Operand {
    Value(ValueId),
    ConstInt(i64),
    Null(TyId),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ConstExpr {
    Bitcast(ValueId, TyId),
}

#[derive(Clone, PartialEq, Debug)]
pub enum InstKind {
    Alloca(TyId),
    Load(Operand),
    Store { val: Operand, ptr: Operand },
    Call { callee: Operand, args: Vec<Operand> },
    Gep { base: Operand, indices: Vec<u64> },
    Bitcast(Operand),
    Phi(Vec<(Operand, BlockId)>),
    Select { cond: Operand, then: Operand, els: Operand },
    Br(BlockId),
    CondBr { cond: Operand, then: BlockId, els: BlockId },
    Ret(Option<Operand>),
}

impl InstKind {
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Self::Alloca(_) | Self::Br(_) => vec![],
            Self::Load(p) | Self::Bitcast(p) => vec![*p],
            Self::Store { val, ptr } => vec![*val, *ptr],
            Self::Call { callee, args } => {
                std::iter::once(*callee).chain(args.iter().copied()).collect()
            }
            Self::Gep { base, .. } => vec![*base],
            Self::Phi(incomings) => incomings.iter().map(|(op, _)| *op).collect(),
            Self::Select { cond, then, els } => vec![*cond, *then, *els],
            Self::CondBr { cond, .. } => vec![*cond],
            Self::Ret(op) => op.iter().copied().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub insts: Vec<ValueId>,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Global {
        module: ModId,
        name: String,
        ty: TyId,
        init: Option<Operand>,
    },
    Function {
        module: ModId,
        name: String,
        sig: TyId,
        params: Vec<ValueId>,
        blocks: Vec<Block>,
    },
    Arg {
        func: ValueId,
        index: u32,
        name: String,
        ty: TyId,
    },
    Inst {
        func: ValueId,
        block: BlockId,
        name: Option<String>,
        ty: TyId,
        kind: InstKind,
    },
    ConstExpr {
        ty: TyId,
        expr: ConstExpr,
    },
}

#[derive(Clone, Debug)]
pub struct Module {
    pub name: String,
    pub globals: Vec<ValueId>,
    pub functions: Vec<ValueId>,
}

/// The IR database: owns all modules, values and types, and provides the
/// identity, user-edge, and traversal services the analyses consume.
#[derive(Debug, Default)]
pub struct IrDb {
    tys: Vec<Ty>,
    ty_ids: FxHashMap<Ty, TyId>,
    values: Vec<ValueKind>,
    value_tys: Vec<TyId>,
    modules: Vec<Module>,
    users: FxHashMap<ValueId, Vec<ValueId>>,
    const_exprs: FxHashMap<ConstExpr, ValueId>,
    names: FxHashMap<String, ValueId>,
}

impl IrDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_ty(&mut self, ty: Ty) -> TyId {
        if let Some(&id) = self.ty_ids.get(&ty) {
            return id;
        }
        let id = TyId(self.tys.len() as u32);
        self.tys.push(ty.clone());
        self.ty_ids.insert(ty, id);
        id
    }

    #[inline]
    pub fn ty(&self, id: TyId) -> &Ty {
        &self.tys[id.0 as usize]
    }

    #[inline]
    pub fn ptr_to(&mut self, ty: TyId) -> TyId {
        self.intern_ty(Ty::Ptr(ty))
    }

    pub fn pointee(&self, ty: TyId) -> Option<TyId> {
        if let Ty::Ptr(t) = self.ty(ty) {
            Some(*t)
        } else {
            None
        }
    }

    pub fn store_size(&self, ty: TyId) -> Option<u64> {
        match self.ty(ty) {
            Ty::Void | Ty::Opaque | Ty::Func(_, _) => None,
            Ty::Int(bits) | Ty::Float(bits) => Some((*bits as u64 + 7) / 8),
            Ty::Ptr(_) => Some(8),
            Ty::Array(t, n) => Some(self.store_size(*t)? * n),
            Ty::Struct(ts) => {
                let mut size = 0;
                for &t in ts {
                    size += self.store_size(t)?;
                }
                Some(size)
            }
        }
    }

    #[inline]
    pub fn value(&self, v: ValueId) -> &ValueKind {
        &self.values[v.0 as usize]
    }

    #[inline]
    pub fn value_ty(&self, v: ValueId) -> TyId {
        self.value_tys[v.0 as usize]
    }

    #[inline]
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    #[inline]
    pub fn module(&self, m: ModId) -> &Module {
        &self.modules[m.0 as usize]
    }

    pub fn module_of(&self, v: ValueId) -> Option<ModId> {
        match self.value(v) {
            ValueKind::Global { module, .. } | ValueKind::Function { module, .. } => Some(*module),
            ValueKind::Arg { func, .. } | ValueKind::Inst { func, .. } => self.module_of(*func),
            ValueKind::ConstExpr { .. } => None,
        }
    }

    pub fn name(&self, v: ValueId) -> Option<&str> {
        match self.value(v) {
            ValueKind::Global { name, .. }
            | ValueKind::Function { name, .. }
            | ValueKind::Arg { name, .. } => Some(name),
            ValueKind::Inst { name, .. } => name.as_deref(),
            ValueKind::ConstExpr { .. } => None,
        }
    }

    #[inline]
    pub fn is_pointer(&self, v: ValueId) -> bool {
        matches!(self.ty(self.value_ty(v)), Ty::Ptr(_))
    }

    #[inline]
    pub fn is_global_object(&self, v: ValueId) -> bool {
        matches!(
            self.value(v),
            ValueKind::Global { .. } | ValueKind::Function { .. }
        )
    }

    #[inline]
    pub fn is_global_var(&self, v: ValueId) -> bool {
        matches!(self.value(v), ValueKind::Global { .. })
    }

    #[inline]
    pub fn is_function(&self, v: ValueId) -> bool {
        matches!(self.value(v), ValueKind::Function { .. })
    }

    #[inline]
    pub fn is_alloca(&self, v: ValueId) -> bool {
        matches!(
            self.value(v),
            ValueKind::Inst {
                kind: InstKind::Alloca(_),
                ..
            }
        )
    }

    #[inline]
    pub fn is_call(&self, v: ValueId) -> bool {
        matches!(
            self.value(v),
            ValueKind::Inst {
                kind: InstKind::Call { .. },
                ..
            }
        )
    }

    #[inline]
    pub fn is_store(&self, v: ValueId) -> bool {
        matches!(
            self.value(v),
            ValueKind::Inst {
                kind: InstKind::Store { .. },
                ..
            }
        )
    }

    /// Every pointer-typed value is admissible as an analysis key: plain
    /// constants are operands, not values, so they can never get here, and
    /// the only constant expressions the database interns are reducible to
    /// a global object.
    #[inline]
    pub fn is_interesting_pointer(&self, v: ValueId) -> bool {
        self.is_pointer(v)
    }

    pub fn interesting_operand(&self, op: Operand) -> Option<ValueId> {
        if let Operand::Value(v) = op {
            if self.is_interesting_pointer(v) {
                return Some(v);
            }
        }
        None
    }

    pub fn containing_fn(&self, v: ValueId) -> Option<ValueId> {
        match self.value(v) {
            ValueKind::Arg { func, .. } | ValueKind::Inst { func, .. } => Some(*func),
            _ => None,
        }
    }

    /// Direct callee of a call instruction, if the callee operand is a
    /// plain function reference.
    pub fn called_function(&self, v: ValueId) -> Option<ValueId> {
        let ValueKind::Inst {
            kind: InstKind::Call { callee, .. },
            ..
        } = self.value(v)
        else {
            return None;
        };
        if let Operand::Value(f) = callee {
            if self.is_function(*f) {
                return Some(*f);
            }
        }
        None
    }

    pub fn const_expr_as_bitcast(&self, v: ValueId) -> Option<(ValueId, TyId)> {
        if let ValueKind::ConstExpr {
            expr: ConstExpr::Bitcast(rhs, ty),
            ..
        } = self.value(v)
        {
            Some((*rhs, *ty))
        } else {
            None
        }
    }

    pub fn users(&self, v: ValueId) -> &[ValueId] {
        self.users.get(&v).map(|us| us.as_slice()).unwrap_or(&[])
    }

    pub fn params(&self, func: ValueId) -> &[ValueId] {
        let ValueKind::Function { params, .. } = self.value(func) else { panic!("{:?} is not a function", func) };
        params
    }

    pub fn blocks(&self, func: ValueId) -> &[Block] {
        let ValueKind::Function { blocks, .. } = self.value(func) else { panic!("{:?} is not a function", func) };
        blocks
    }

    pub fn insts(&self, func: ValueId) -> impl Iterator<Item = ValueId> + '_ {
        self.blocks(func)
            .iter()
            .flat_map(|b| b.insts.iter().copied())
    }

    #[inline]
    pub fn has_body(&self, func: ValueId) -> bool {
        !self.blocks(func).is_empty()
    }

    /// Visits every global, function, pointer-typed argument, and
    /// instruction exactly once, in a fixed order. The order is a contract:
    /// it is the basis for the ids used by the points-to persistence.
    pub fn walk_values(&self, mut f: impl FnMut(ValueId)) {
        for m in &self.modules {
            for &g in &m.globals {
                f(g);
            }
            for &func in &m.functions {
                f(func);
                for &a in self.params(func) {
                    if self.is_pointer(a) {
                        f(a);
                    }
                }
                for b in self.blocks(func) {
                    for &i in &b.insts {
                        f(i);
                    }
                }
            }
        }
    }

    pub fn add_module(&mut self, name: &str) -> ModId {
        let m = ModId(self.modules.len() as u32);
        self.modules.push(Module {
            name: name.to_string(),
            globals: vec![],
            functions: vec![],
        });
        m
    }

    fn push_value(&mut self, kind: ValueKind, ty: TyId) -> ValueId {
        let v = ValueId(self.values.len() as u32);
        self.values.push(kind);
        self.value_tys.push(ty);
        v
    }

    fn record_name(&mut self, name: &str, v: ValueId) {
        let old = self.names.insert(name.to_string(), v);
        assert!(old.is_none(), "duplicate name @{}", name);
    }

    pub fn add_global(
        &mut self,
        module: ModId,
        name: &str,
        ty: TyId,
        init: Option<Operand>,
    ) -> ValueId {
        let ptr_ty = self.ptr_to(ty);
        let v = self.push_value(
            ValueKind::Global {
                module,
                name: name.to_string(),
                ty,
                init,
            },
            ptr_ty,
        );
        self.modules[module.0 as usize].globals.push(v);
        self.record_name(name, v);
        if let Some(Operand::Value(u)) = init {
            self.users.entry(u).or_default().push(v);
        }
        v
    }

    pub fn declare_function(
        &mut self,
        module: ModId,
        name: &str,
        params: &[(String, TyId)],
        ret: TyId,
    ) -> ValueId {
        let sig = self.intern_ty(Ty::Func(params.iter().map(|(_, t)| *t).collect(), ret));
        let fn_ty = self.ptr_to(sig);
        let func = self.push_value(
            ValueKind::Function {
                module,
                name: name.to_string(),
                sig,
                params: vec![],
                blocks: vec![],
            },
            fn_ty,
        );
        self.modules[module.0 as usize].functions.push(func);
        self.record_name(name, func);
        for (i, (pname, pty)) in params.iter().enumerate() {
            let a = self.push_value(
                ValueKind::Arg {
                    func,
                    index: i as u32,
                    name: pname.clone(),
                    ty: *pty,
                },
                *pty,
            );
            let ValueKind::Function { params, .. } = &mut self.values[func.0 as usize] else {
                unreachable!()
            };
            params.push(a);
        }
        func
    }

    pub fn add_block(&mut self, func: ValueId, name: &str) -> BlockId {
        let ValueKind::Function { blocks, .. } = &mut self.values[func.0 as usize] else {
            panic!("{:?} is not a function", func)
        };
        let b = BlockId(blocks.len() as u32);
        blocks.push(Block {
            name: name.to_string(),
            insts: vec![],
        });
        b
    }

    pub fn add_inst(
        &mut self,
        func: ValueId,
        block: BlockId,
        name: Option<&str>,
        ty: TyId,
        kind: InstKind,
    ) -> ValueId {
        let operands = kind.operands();
        let v = self.push_value(
            ValueKind::Inst {
                func,
                block,
                name: name.map(|s| s.to_string()),
                ty,
                kind,
            },
            ty,
        );
        for op in operands {
            if let Operand::Value(u) = op {
                self.users.entry(u).or_default().push(v);
            }
        }
        let ValueKind::Function { blocks, .. } = &mut self.values[func.0 as usize] else {
            unreachable!()
        };
        blocks[block.0 as usize].insts.push(v);
        v
    }

    /// Interned `bitcast <global object> to T*` constant expression.
    pub fn const_bitcast(&mut self, v: ValueId, ty: TyId) -> ValueId {
        assert!(self.is_global_object(v), "{:?} is not a global object", v);
        assert!(self.pointee(ty).is_some(), "bitcast target must be a pointer");
        let expr = ConstExpr::Bitcast(v, ty);
        if let Some(&ce) = self.const_exprs.get(&expr) {
            return ce;
        }
        let ce = self.push_value(ValueKind::ConstExpr { ty, expr }, ty);
        self.const_exprs.insert(expr, ce);
        self.users.entry(v).or_default().push(ce);
        ce
    }

    pub fn gep_result_ty(&mut self, base: TyId, indices: &[u64]) -> Option<TyId> {
        let mut t = self.pointee(base)?;
        for &i in indices.iter().skip(1) {
            t = match self.ty(t).clone() {
                Ty::Array(el, _) => el,
                Ty::Struct(fs) => *fs.get(i as usize)?,
                _ => return None,
            };
        }
        Some(self.ptr_to(t))
    }

    pub fn value_by_name(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    /// Looks up an argument or named instruction of a function. Test helper.
    pub fn local(&self, func: ValueId, name: &str) -> Option<ValueId> {
        for &a in self.params(func) {
            if self.name(a) == Some(name) {
                return Some(a);
            }
        }
        self.insts(func).find(|&i| self.name(i) == Some(name))
    }

    pub fn display_ty(&self, ty: TyId) -> String {
        match self.ty(ty) {
            Ty::Void => "void".to_string(),
            Ty::Opaque => "opaque".to_string(),
            Ty::Int(bits) => format!("i{}", bits),
            Ty::Float(bits) => format!("f{}", bits),
            Ty::Ptr(t) => format!("{}*", self.display_ty(*t)),
            Ty::Array(t, n) => format!("[{} x {}]", n, self.display_ty(*t)),
            Ty::Struct(ts) => {
                let fields: Vec<_> = ts.iter().map(|&t| self.display_ty(t)).collect();
                format!("{{{}}}", fields.join(", "))
            }
            Ty::Func(ps, r) => {
                let params: Vec<_> = ps.iter().map(|&t| self.display_ty(t)).collect();
                format!("({}) -> {}", params.join(", "), self.display_ty(*r))
            }
        }
    }

    fn display_operand(&self, op: Operand) -> String {
        match op {
            Operand::Value(v) => self.short_name(v),
            Operand::ConstInt(n) => n.to_string(),
            Operand::Null(_) => "null".to_string(),
        }
    }

    fn short_name(&self, v: ValueId) -> String {
        match self.value(v) {
            ValueKind::Global { name, .. } | ValueKind::Function { name, .. } => {
                format!("@{}", name)
            }
            ValueKind::Arg { name, .. } => format!("%{}", name),
            ValueKind::Inst { name, .. } => match name {
                Some(n) => format!("%{}", n),
                None => "%_".to_string(),
            },
            ValueKind::ConstExpr {
                expr: ConstExpr::Bitcast(rhs, ty),
                ..
            } => format!("bitcast {} to {}", self.short_name(*rhs), self.display_ty(*ty)),
        }
    }

    fn display_inst_kind(&self, kind: &InstKind) -> String {
        match kind {
            InstKind::Alloca(ty) => format!("alloca {}", self.display_ty(*ty)),
            InstKind::Load(p) => format!("load {}", self.display_operand(*p)),
            InstKind::Store { val, ptr } => format!(
                "store {}, {}",
                self.display_operand(*val),
                self.display_operand(*ptr)
            ),
            InstKind::Call { callee, args } => {
                let args: Vec<_> = args.iter().map(|&a| self.display_operand(a)).collect();
                format!("call {}({})", self.display_operand(*callee), args.join(", "))
            }
            InstKind::Gep { base, indices } => {
                let idx: Vec<_> = indices.iter().map(|i| i.to_string()).collect();
                format!("gep {}, {}", self.display_operand(*base), idx.join(", "))
            }
            InstKind::Bitcast(op) => format!("bitcast {}", self.display_operand(*op)),
            InstKind::Phi(incomings) => {
                let ins: Vec<_> = incomings
                    .iter()
                    .map(|(op, _)| format!("[{}]", self.display_operand(*op)))
                    .collect();
                format!("phi {}", ins.join(", "))
            }
            InstKind::Select { cond, then, els } => format!(
                "select {}, {}, {}",
                self.display_operand(*cond),
                self.display_operand(*then),
                self.display_operand(*els)
            ),
            InstKind::Br(_) => "br".to_string(),
            InstKind::CondBr { cond, .. } => format!("condbr {}", self.display_operand(*cond)),
            InstKind::Ret(Some(op)) => format!("ret {}", self.display_operand(*op)),
            InstKind::Ret(None) => "ret".to_string(),
        }
    }

    /// Printable form of a value, used by the persistence preamble and the
    /// debugging output.
    pub fn display_value(&self, v: ValueId) -> String {
        match self.value(v) {
            ValueKind::Global { name, ty, .. } => {
                format!("@{} = global {}", name, self.display_ty(*ty))
            }
            ValueKind::Function { name, sig, .. } => {
                format!("@{} = func {}", name, self.display_ty(*sig))
            }
            ValueKind::Arg { name, func, .. } => {
                format!("%{} in {}", name, self.short_name(*func))
            }
            ValueKind::Inst {
                name, kind, func, ..
            } => {
                let body = self.display_inst_kind(kind);
                match name {
                    Some(n) => format!("%{} = {} in {}", n, body, self.short_name(*func)),
                    None => format!("{} in {}", body, self.short_name(*func)),
                }
            }
            ValueKind::ConstExpr { .. } => self.short_name(v),
        }
    }
}
