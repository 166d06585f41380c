use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{ConstExpr, InstKind, IrDb, Operand, ValueId, ValueKind};

mod solver;

use solver::Solver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasResult {
    No,
    May,
    Partial,
    Must,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OracleKind {
    #[default]
    Andersen,
}

/// Function-local abstract objects. `Extern` stands for all memory that
/// already exists outside the function: whatever the caller passed in and
/// whatever unknown callees return. Globals overlap with it; fresh stack
/// and heap objects do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Object {
    Stack(ValueId),
    Heap(ValueId),
    Global(ValueId),
    Extern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Value(ValueId),
    Mem(Object),
}

/// Per-function alias query results.
#[derive(Debug)]
pub struct AaResults {
    pts: FxHashMap<ValueId, FxHashSet<Object>>,
    derived: FxHashSet<ValueId>,
}

impl AaResults {
    pub fn points_to(&self, v: ValueId) -> Option<&FxHashSet<Object>> {
        self.pts.get(&v)
    }

    #[inline]
    pub fn is_derived(&self, v: ValueId) -> bool {
        self.derived.contains(&v)
    }

    /// The sizes are advisory: this oracle is field-insensitive and ignores
    /// them, but the signature keeps them so a size-aware oracle can be
    /// swapped in.
    pub fn alias(
        &self,
        p1: ValueId,
        _size1: Option<u64>,
        p2: ValueId,
        _size2: Option<u64>,
    ) -> AliasResult {
        if p1 == p2 {
            return AliasResult::Must;
        }
        let (o1, o2) = match (self.pts.get(&p1), self.pts.get(&p2)) {
            (Some(o1), Some(o2)) => (o1, o2),
            _ => return AliasResult::No,
        };
        if !o1.iter().any(|&a| o2.iter().any(|&b| overlaps(a, b))) {
            return AliasResult::No;
        }
        if o1.len() == 1 && o1 == o2 && !o1.contains(&Object::Extern) {
            if self.derived.contains(&p1) || self.derived.contains(&p2) {
                return AliasResult::Partial;
            }
            return AliasResult::Must;
        }
        AliasResult::May
    }
}

fn overlaps(a: Object, b: Object) -> bool {
    a == b
        || matches!(
            (a, b),
            (Object::Extern, Object::Global(_)) | (Object::Global(_), Object::Extern)
        )
}

/// Lazy per-function oracle. Results are cached until `erase` releases
/// them; the points-to engine erases each function right after folding its
/// answers.
#[derive(Debug)]
pub struct AliasAnalysis {
    kind: OracleKind,
    heap_fns: FxHashSet<String>,
    cache: FxHashMap<ValueId, AaResults>,
}

impl AliasAnalysis {
    pub fn new(kind: OracleKind, heap_fns: FxHashSet<String>) -> Self {
        Self {
            kind,
            heap_fns,
            cache: FxHashMap::default(),
        }
    }

    pub fn results(&mut self, db: &IrDb, func: ValueId) -> &AaResults {
        if !self.cache.contains_key(&func) {
            let res = match self.kind {
                OracleKind::Andersen => compute(db, func, &self.heap_fns),
            };
            self.cache.insert(func, res);
        }
        &self.cache[&func]
    }

    pub fn erase(&mut self, func: ValueId) {
        self.cache.remove(&func);
    }
}

fn compute(db: &IrDb, func: ValueId, heap_fns: &FxHashSet<String>) -> AaResults {
    let mut solver = Solver::new();
    let mut derived = FxHashSet::default();
    solver.add_token(Object::Extern, Node::Mem(Object::Extern));

    let module = db.module_of(func).unwrap();
    for &g in &db.module(module).globals {
        solver.add_token(Object::Global(g), Node::Value(g));
        let ValueKind::Global { init, .. } = db.value(g) else { unreachable!() };
        if let Some(op) = init {
            if let Some(u) = pointer_operand(db, *op, &mut solver) {
                solver.add_edge(u, Node::Mem(Object::Global(g)));
            }
        }
    }

    for &a in db.params(func) {
        if db.is_pointer(a) {
            solver.add_token(Object::Extern, Node::Value(a));
        }
    }

    for i in db.insts(func) {
        let ValueKind::Inst { kind, .. } = db.value(i) else { unreachable!() };
        match kind {
            InstKind::Alloca(_) => solver.add_token(Object::Stack(i), Node::Value(i)),
            InstKind::Load(p) => {
                if db.is_pointer(i) {
                    if let Some(p) = pointer_operand(db, *p, &mut solver) {
                        solver.add_load(p, Node::Value(i));
                    }
                }
            }
            InstKind::Store { val, ptr } => {
                let val = pointer_operand(db, *val, &mut solver);
                let ptr = pointer_operand(db, *ptr, &mut solver);
                if let (Some(val), Some(ptr)) = (val, ptr) {
                    solver.add_store(ptr, val);
                }
            }
            InstKind::Call { args, .. } => {
                if db.is_pointer(i) {
                    let heap = db
                        .called_function(i)
                        .and_then(|f| db.name(f))
                        .is_some_and(|name| heap_fns.contains(name));
                    let obj = if heap { Object::Heap(i) } else { Object::Extern };
                    solver.add_token(obj, Node::Value(i));
                }
                // pointer arguments escape into caller-visible memory
                for arg in args {
                    if let Some(v) = pointer_operand(db, *arg, &mut solver) {
                        solver.add_edge(v, Node::Mem(Object::Extern));
                    }
                }
            }
            InstKind::Gep { base, .. } => {
                if let Some(b) = pointer_operand(db, *base, &mut solver) {
                    solver.add_edge(b, Node::Value(i));
                }
                derived.insert(i);
            }
            InstKind::Bitcast(op) => copy(db, i, &[*op], &mut solver, &mut derived),
            InstKind::Phi(incomings) => {
                let ops: Vec<_> = incomings.iter().map(|(op, _)| *op).collect();
                copy(db, i, &ops, &mut solver, &mut derived);
            }
            InstKind::Select { then, els, .. } => {
                copy(db, i, &[*then, *els], &mut solver, &mut derived)
            }
            InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret(_) => {}
        }
    }

    solver.propagate();
    let mut pts = FxHashMap::default();
    for (node, objs) in solver.solutions() {
        if let Node::Value(v) = node {
            pts.insert(v, objs);
        }
    }
    AaResults { pts, derived }
}

fn copy(
    db: &IrDb,
    dst: ValueId,
    srcs: &[Operand],
    solver: &mut Solver,
    derived: &mut FxHashSet<ValueId>,
) {
    if !db.is_pointer(dst) {
        return;
    }
    let mut resolved = false;
    for &src in srcs {
        if let Some(s) = pointer_operand(db, src, solver) {
            resolved = true;
            solver.add_edge(s, Node::Value(dst));
            if let Node::Value(v) = s {
                if derived.contains(&v) {
                    derived.insert(dst);
                }
            }
        }
    }
    // a pointer conjured from an integer has unknown provenance
    if !resolved && srcs.iter().any(|s| matches!(s, Operand::ConstInt(_))) {
        solver.add_token(Object::Extern, Node::Value(dst));
    }
}

fn pointer_operand(db: &IrDb, op: Operand, solver: &mut Solver) -> Option<Node> {
    let Operand::Value(v) = op else { return None };
    if !db.is_pointer(v) {
        return None;
    }
    match db.value(v) {
        ValueKind::Global { .. } | ValueKind::Function { .. } => {
            solver.add_token(Object::Global(v), Node::Value(v));
        }
        ValueKind::ConstExpr {
            expr: ConstExpr::Bitcast(rhs, _),
            ..
        } => {
            solver.add_token(Object::Global(*rhs), Node::Value(*rhs));
            solver.add_edge(Node::Value(*rhs), Node::Value(v));
        }
        _ => {}
    }
    Some(Node::Value(v))
}
