use etrace::some_or;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{Node, Object};

#[derive(Debug, Default)]
pub struct Solver {
    solutions: FxHashMap<Node, FxHashSet<Object>>,
    successors: FxHashMap<Node, FxHashSet<Node>>,
    loads: FxHashMap<Node, FxHashSet<Node>>,
    stores: FxHashMap<Node, FxHashSet<Node>>,
    worklist: Vec<(Object, Node)>,
}

impl Solver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&mut self, t: Object, v: Node) {
        if self.solutions.entry(v).or_default().insert(t) {
            self.worklist.push((t, v));
        }
    }

    pub fn add_edge(&mut self, x: Node, y: Node) {
        if x != y && self.successors.entry(x).or_default().insert(y) {
            for t in some_or!(self.solutions.get(&x), return).clone() {
                self.add_token(t, y);
            }
        }
    }

    pub fn add_load(&mut self, p: Node, dst: Node) {
        self.loads.entry(p).or_default().insert(dst);
    }

    pub fn add_store(&mut self, p: Node, src: Node) {
        self.stores.entry(p).or_default().insert(src);
    }

    pub fn propagate(&mut self) {
        while let Some((t, x)) = self.worklist.pop() {
            if let Some(dsts) = self.loads.get(&x) {
                for dst in dsts.clone() {
                    self.add_edge(Node::Mem(t), dst);
                }
            }
            if let Some(srcs) = self.stores.get(&x) {
                for src in srcs.clone() {
                    self.add_edge(src, Node::Mem(t));
                }
            }
            if let Some(ys) = self.successors.get(&x) {
                for y in ys.clone() {
                    self.add_token(t, y);
                }
            }
        }
    }

    pub fn solutions(self) -> FxHashMap<Node, FxHashSet<Object>> {
        self.solutions
    }
}
