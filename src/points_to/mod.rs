use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use etrace::some_or;
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    andersen::{AliasAnalysis, AliasResult, OracleKind},
    disjoint_set::DisjointSets,
    ir::{InstKind, IrDb, Operand, ValueId, ValueKind},
};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct Config {
    /// With lazy evaluation, function bodies are analyzed on demand as
    /// queries arrive; otherwise every defined function is analyzed at
    /// construction time.
    pub lazy: bool,
    pub oracle: OracleKind,
    pub heap_alloc_fns: FxHashSet<String>,
    pub warn_pointer_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lazy: true,
            oracle: OracleKind::Andersen,
            heap_alloc_fns: default_heap_alloc_fns(),
            warn_pointer_threshold: 100,
        }
    }
}

pub fn default_heap_alloc_fns() -> FxHashSet<String> {
    [
        "malloc",
        "calloc",
        "realloc",
        "aligned_alloc",
        "posix_memalign",
        "_Znwm",
        "_Znam",
        "_ZnwmRKSt9nothrow_t",
        "_ZnamRKSt9nothrow_t",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: {msg}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },
}

impl PersistError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Program-wide points-to sets over the values of an IR database.
///
/// Values that may alias are kept in one equivalence class of a union-find
/// keyed by engine-local dense indices. Classes grow as the per-function
/// oracle verdicts and the global-use rules are folded in; they never
/// shrink.
pub struct PointsToSets<'a> {
    db: &'a IrDb,
    conf: Config,
    values: Vec<ValueId>,
    indices: FxHashMap<ValueId, u32>,
    sets: DisjointSets,
    analyzed_fns: FxHashSet<ValueId>,
    aa: AliasAnalysis,
}

impl<'a> PointsToSets<'a> {
    pub fn new(db: &'a IrDb, conf: Config) -> Self {
        let mut this = Self::with_config(db, conf);
        for m in db.modules() {
            for &g in &m.globals {
                this.compute_values_points_to_set(g);
            }
            for &f in &m.functions {
                this.compute_values_points_to_set(f);
            }
            if !this.conf.lazy {
                for &f in &m.functions {
                    if db.has_body(f) {
                        this.compute_functions_points_to_set(Some(f));
                    }
                }
            }
        }
        this
    }

    /// Restores an engine saved by [`save`](Self::save) against the same IR
    /// database. On failure the partially restored state is dropped.
    pub fn load(db: &'a IrDb, path: &Path, conf: Config) -> Result<Self, PersistError> {
        let text = std::fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;
        Self::read(db, &text, conf).map_err(|(line, msg)| PersistError::Parse {
            path: path.to_path_buf(),
            line,
            msg,
        })
    }

    fn with_config(db: &'a IrDb, conf: Config) -> Self {
        let aa = AliasAnalysis::new(conf.oracle, conf.heap_alloc_fns.clone());
        Self {
            db,
            conf,
            values: vec![],
            indices: FxHashMap::default(),
            sets: DisjointSets::new(),
            analyzed_fns: FxHashSet::default(),
            aa,
        }
    }

    pub fn analyzed_functions(&self) -> &FxHashSet<ValueId> {
        &self.analyzed_fns
    }

    fn add_singleton_points_to_set(&mut self, v: ValueId) -> u32 {
        if let Some(&i) = self.indices.get(&v) {
            return i;
        }
        let i = self.sets.add();
        self.values.push(v);
        self.indices.insert(v, i);
        i
    }

    fn index_of(&self, v: ValueId) -> u32 {
        *self
            .indices
            .get(&v)
            .unwrap_or_else(|| panic!("no points-to set for {}", self.db.display_value(v)))
    }

    fn merge_points_to_sets(&mut self, v1: ValueId, v2: ValueId) {
        let i1 = self.index_of(v1);
        let i2 = self.index_of(v2);
        self.sets.union(i1, i2);
    }

    fn compute_values_points_to_set(&mut self, v: ValueId) {
        let db = self.db;
        if !db.is_interesting_pointer(v) {
            return;
        }
        self.add_singleton_points_to_set(v);
        if db.is_global_object(v) {
            // A global object can be a function or a global variable, and
            // function pointers alias like any other pointer. Its uses may
            // be spread over arbitrarily many functions; merging at the use
            // sites captures aliasing the per-function oracle cannot see.
            for &user in db.users(v) {
                let ValueKind::Inst { func, kind, .. } = db.value(user) else { continue };
                self.compute_functions_points_to_set(Some(*func));
                if !db.is_function(v) && db.is_interesting_pointer(user) {
                    self.merge_points_to_sets(user, v);
                } else if let InstKind::Store { val, ptr } = kind {
                    if let (Operand::Value(x), Operand::Value(p)) = (*val, *ptr) {
                        // the pointer operand of a store is always an
                        // interesting pointer
                        if db.is_interesting_pointer(x) {
                            self.merge_points_to_sets(x, p);
                        }
                    }
                }
            }
        } else {
            let func = db.containing_fn(v);
            if func.is_none() {
                debug!("no containing function for {}", db.display_value(v));
            }
            self.compute_functions_points_to_set(func);
        }
    }

    fn compute_functions_points_to_set(&mut self, func: Option<ValueId>) {
        let func = some_or!(func, return);
        if self.analyzed_fns.contains(&func) {
            return;
        }
        let db = self.db;
        debug!("analyzing function @{}", db.name(func).unwrap_or("?"));
        // mark before any sub-work to cut recursion through global handling
        self.analyzed_fns.insert(func);

        let mut pointers = IndexSet::new();
        for &a in db.params(func) {
            if db.is_pointer(a) {
                pointers.insert(a);
            }
        }
        let insts: Vec<_> = db.insts(func).collect();
        for &i in &insts {
            if db.is_pointer(i) {
                pointers.insert(i);
            }
            let ValueKind::Inst { kind, .. } = db.value(i) else { unreachable!() };
            if let InstKind::Store { val, ptr } = kind {
                if let (Operand::Value(x), Operand::Value(p)) = (*val, *ptr) {
                    if db.is_pointer(x) {
                        if db.is_function(x) {
                            self.add_singleton_points_to_set(x);
                            self.add_singleton_points_to_set(p);
                            self.merge_points_to_sets(x, p);
                        }
                        if let Some((rhs, _)) = db.const_expr_as_bitcast(x) {
                            self.add_singleton_points_to_set(rhs);
                            self.add_singleton_points_to_set(x);
                            self.add_singleton_points_to_set(p);
                            self.merge_points_to_sets(rhs, p);
                            self.merge_points_to_sets(x, p);
                        }
                    }
                }
            }
            match kind {
                InstKind::Call { callee, args } => {
                    // skip the callee of direct calls
                    if let Operand::Value(c) = callee {
                        if !db.is_function(*c) && db.is_interesting_pointer(*c) {
                            pointers.insert(*c);
                        }
                    }
                    for &arg in args {
                        if let Some(v) = db.interesting_operand(arg) {
                            pointers.insert(v);
                        }
                    }
                }
                _ => {
                    for op in kind.operands() {
                        if let Some(v) = db.interesting_operand(op) {
                            pointers.insert(v);
                        }
                    }
                }
            }
        }
        if let Some(m) = db.module_of(func) {
            for &g in &db.module(m).globals {
                pointers.insert(g);
            }
        }

        for &p in &pointers {
            self.add_singleton_points_to_set(p);
        }

        if pointers.len() > self.conf.warn_pointer_threshold {
            warn!(
                "@{}: {} pointers, the pairwise alias queries are quadratic",
                db.name(func).unwrap_or("?"),
                pointers.len()
            );
        }

        let aa = self.aa.results(db, func);
        let mut to_merge = vec![];
        for (i1, &p1) in pointers.iter().enumerate() {
            let s1 = db.pointee(db.value_ty(p1)).and_then(|t| db.store_size(t));
            for &p2 in pointers.iter().take(i1) {
                let s2 = db.pointee(db.value_ty(p2)).and_then(|t| db.store_size(t));
                if !matches!(aa.alias(p1, s1, p2, s2), AliasResult::No) {
                    to_merge.push((p1, p2));
                }
            }
        }
        for (p1, p2) in to_merge {
            self.merge_points_to_sets(p1, p2);
        }
        self.aa.erase(func);
    }

    /// Collapsed alias query: only `MustAlias` (same points-to set) and
    /// `NoAlias` are ever returned.
    pub fn alias(&mut self, v1: ValueId, v2: ValueId) -> AliasResult {
        let db = self.db;
        if !db.is_interesting_pointer(v1) || !db.is_interesting_pointer(v2) {
            return AliasResult::No;
        }
        self.compute_values_points_to_set(v1);
        self.compute_values_points_to_set(v2);
        let i1 = some_or!(self.indices.get(&v1).copied(), return AliasResult::No);
        let i2 = some_or!(self.indices.get(&v2).copied(), return AliasResult::No);
        if self.sets.same_set(i1, i2) {
            AliasResult::Must
        } else {
            AliasResult::No
        }
    }

    pub fn points_to_set(&mut self, v: ValueId) -> FxHashSet<ValueId> {
        if !self.db.is_interesting_pointer(v) {
            return FxHashSet::default();
        }
        self.compute_values_points_to_set(v);
        let i = some_or!(self.indices.get(&v).copied(), return FxHashSet::default());
        self.sets
            .members(i)
            .map(|j| self.values[j as usize])
            .collect()
    }

    fn is_heap_alloc_call(&self, p: ValueId) -> bool {
        let db = self.db;
        if !db.is_call(p) {
            return false;
        }
        let callee = some_or!(db.called_function(p), return false);
        let name = some_or!(db.name(callee), return false);
        self.conf.heap_alloc_fns.contains(name)
    }

    fn is_inter_reachable_alloc_site(&self, p: ValueId) -> bool {
        self.db.is_alloca(p) || self.is_heap_alloc_call(p)
    }

    fn is_intra_reachable_alloc_site(
        &self,
        p: ValueId,
        vfun: Option<ValueId>,
        v_global: bool,
    ) -> bool {
        if !self.db.is_alloca(p) && !self.is_heap_alloc_call(p) {
            return false;
        }
        v_global || (vfun.is_some() && vfun == self.db.containing_fn(p))
    }

    /// Allocation sites reachable from `v`: stack allocations and calls to
    /// recognized heap allocators within `v`'s points-to set. With
    /// `intra_proc_only`, sites are restricted to `v`'s own function unless
    /// `v` is a global object.
    pub fn reachable_alloc_sites(&mut self, v: ValueId, intra_proc_only: bool) -> FxHashSet<ValueId> {
        let db = self.db;
        if !db.is_interesting_pointer(v) {
            return FxHashSet::default();
        }
        self.compute_values_points_to_set(v);
        let i = some_or!(self.indices.get(&v).copied(), return FxHashSet::default());
        let members: Vec<_> = self
            .sets
            .members(i)
            .map(|j| self.values[j as usize])
            .collect();
        if !intra_proc_only {
            members
                .into_iter()
                .filter(|&p| self.is_inter_reachable_alloc_site(p))
                .collect()
        } else {
            let vfun = db.containing_fn(v);
            let v_global = db.is_global_object(v);
            members
                .into_iter()
                .filter(|&p| self.is_intra_reachable_alloc_site(p, vfun, v_global))
                .collect()
        }
    }

    pub fn is_in_reachable_alloc_sites(
        &mut self,
        v: ValueId,
        candidate: ValueId,
        intra_proc_only: bool,
    ) -> bool {
        let db = self.db;
        if !db.is_interesting_pointer(v) {
            return false;
        }
        self.compute_values_points_to_set(v);
        let is_site = if intra_proc_only {
            let vfun = db.containing_fn(v);
            let v_global = db.is_global_object(v);
            self.is_intra_reachable_alloc_site(candidate, vfun, v_global)
        } else {
            self.is_inter_reachable_alloc_site(candidate)
        };
        if !is_site {
            return false;
        }
        let i = some_or!(self.indices.get(&v).copied(), return false);
        let c = some_or!(self.indices.get(&candidate).copied(), return false);
        self.sets.same_set(i, c)
    }

    /// Externally asserted alias. The kind is informational only; any kind
    /// merges the two sets.
    pub fn introduce_alias(&mut self, v1: ValueId, v2: ValueId, _kind: AliasResult) {
        let db = self.db;
        if !db.is_interesting_pointer(v1) || !db.is_interesting_pointer(v2) {
            return;
        }
        self.compute_values_points_to_set(v1);
        self.compute_values_points_to_set(v2);
        self.merge_points_to_sets(v1, v2);
    }

    /// Folds another view over the same IR database into this one. Every
    /// incoming equivalence class is united with all classes of `self` it
    /// intersects, so classes bridging several pre-existing classes close
    /// transitively.
    pub fn merge_with(&mut self, other: &PointsToSets<'_>) {
        assert!(
            std::ptr::eq(self.db, other.db),
            "merging points-to sets over different IR databases"
        );
        self.analyzed_fns.extend(other.analyzed_fns.iter().copied());
        let mut visited = FxHashSet::default();
        for i in 0..other.values.len() as u32 {
            let root = other.sets.find(i);
            if !visited.insert(root) {
                continue;
            }
            let mut members = other.sets.members(root).map(|j| other.values[j as usize]);
            let first = members.next().unwrap();
            self.add_singleton_points_to_set(first);
            for v in members {
                self.add_singleton_points_to_set(v);
                self.merge_points_to_sets(first, v);
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let file = File::create(path).map_err(|e| PersistError::io(path, e))?;
        self.write(BufWriter::new(file))
            .map_err(|e| PersistError::io(path, e))
    }

    pub fn write(&self, mut w: impl Write) -> io::Result<()> {
        let db = self.db;
        let mut order = vec![];
        db.walk_values(|v| order.push(v));

        // the value ids are informational; only their assignment order
        // matters for the following sections
        writeln!(w, "[ValueIds]")?;
        let mut ids = FxHashMap::default();
        for (id, &v) in order.iter().enumerate() {
            ids.insert(v, id);
            writeln!(w, "{}: {}", id, db.display_value(v))?;
        }

        writeln!(w, "[AnalyzedFunctions]")?;
        for f in &self.analyzed_fns {
            write!(w, "{} ", ids[f])?;
        }
        writeln!(w)?;

        writeln!(w, "[PointsToSets]")?;
        let mut printed = FxHashSet::default();
        for i in 0..self.values.len() as u32 {
            let root = self.sets.find(i);
            if !printed.insert(root) {
                continue;
            }
            for j in self.sets.members(root) {
                // constant expressions have no traversal id and are not
                // persisted
                if let Some(id) = ids.get(&self.values[j as usize]) {
                    write!(w, "{} ", id)?;
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }

    fn read(db: &'a IrDb, text: &str, conf: Config) -> Result<Self, (usize, String)> {
        let mut this = Self::with_config(db, conf);
        let mut order = vec![];
        db.walk_values(|v| order.push(v));

        let mut lines = text.lines().enumerate();
        loop {
            let (_, line) = lines
                .next()
                .ok_or((0, "missing [AnalyzedFunctions] section".to_string()))?;
            if line == "[AnalyzedFunctions]" {
                break;
            }
        }
        let mut in_sets = false;
        for (n, line) in &mut lines {
            if line == "[PointsToSets]" {
                in_sets = true;
                break;
            }
            for cell in line.split(' ') {
                if cell.is_empty() {
                    continue;
                }
                let v = parse_value_id(cell, &order).map_err(|msg| (n + 1, msg))?;
                if !db.is_function(v) {
                    return Err((n + 1, format!("{} is not a function", db.display_value(v))));
                }
                this.analyzed_fns.insert(v);
            }
        }
        if in_sets {
            for (n, line) in lines {
                let mut first = None;
                for cell in line.split(' ') {
                    if cell.is_empty() {
                        continue;
                    }
                    let v = parse_value_id(cell, &order).map_err(|msg| (n + 1, msg))?;
                    this.add_singleton_points_to_set(v);
                    match first {
                        None => first = Some(v),
                        Some(f) => this.merge_points_to_sets(f, v),
                    }
                }
            }
        }
        Ok(this)
    }

    pub fn print(&self, w: &mut impl Write) -> io::Result<()> {
        for (i, &v) in self.values.iter().enumerate() {
            writeln!(w, "V: {}", self.db.display_value(v))?;
            for j in self.sets.members(i as u32) {
                writeln!(
                    w,
                    "\tpoints to -> {}",
                    self.db.display_value(self.values[j as usize])
                )?;
            }
        }
        Ok(())
    }

    pub fn peek_into_points_to_set(&self, v: ValueId, peek: usize) {
        let i = some_or!(self.indices.get(&v).copied(), return);
        println!("Value: {}", self.db.display_value(v));
        println!("aliases with: {{");
        let size = self.sets.size_of(i) as usize;
        for (n, j) in self.sets.members(i).enumerate() {
            if n == peek {
                println!("... and {} more", size - peek);
                break;
            }
            println!("{}", self.db.display_value(self.values[j as usize]));
        }
        println!("}}");
    }

    /// Histogram of points-to set sizes, one count per map key, with bars
    /// normalized to 50 columns. A positive `peek` additionally prints up
    /// to `peek` members of one of the largest sets.
    pub fn draw_points_to_sets_distribution(&self, peek: usize) {
        let mut size_amounts: Vec<(u32, usize)> = vec![];
        for i in 0..self.values.len() as u32 {
            let size = self.sets.size_of(i);
            match size_amounts.iter_mut().find(|(s, _)| *s == size) {
                Some((_, n)) => *n += 1,
                None => size_amounts.push((size, 1)),
            }
        }
        size_amounts.sort_by_key(|&(s, _)| s);
        let total: usize = size_amounts.iter().map(|&(_, n)| n).sum();

        println!("{:>10}  {:^50} {:>10}", "PtS Size", "Distribution", "Number of sets");
        for &(size, n) in &size_amounts {
            let bar = "*".repeat(n * 50 / total.max(1));
            println!("{:>10} |{:<50} {:<10}", size, bar, n);
        }
        println!();

        if peek > 0 {
            let largest = some_or!(size_amounts.last(), return).0;
            for (i, &v) in self.values.iter().enumerate() {
                if self.sets.size_of(i as u32) == largest {
                    println!("Peek into one of the biggest points-to sets.");
                    self.peek_into_points_to_set(v, peek);
                    return;
                }
            }
        }
    }
}

fn parse_value_id(cell: &str, order: &[ValueId]) -> Result<ValueId, String> {
    let id: usize = cell
        .parse()
        .map_err(|_| format!("bad value id {}", cell))?;
    order
        .get(id)
        .copied()
        .ok_or_else(|| format!("value id {} out of range", id))
}
