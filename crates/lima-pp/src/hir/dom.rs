//! Dominator tree over the reachable blocks (Cooper, Harvey and Kennedy's iterative scheme).

use hashbrown::HashMap;

use super::{BlockId, Program};

#[derive(Debug, Clone)]
pub struct Dominators {
    rpo: Vec<BlockId>,
    order: HashMap<BlockId, usize>,
    idom: Vec<usize>,
}

/// Reachable blocks in reverse post-order. Taken branch targets are visited first.
pub fn reverse_postorder(program: &Program) -> Vec<BlockId> {
    let mut post = Vec::new();
    let mut visited = hashbrown::HashSet::new();
    let mut stack = vec![(program.entry, false)];
    while let Some((block, expanded)) = stack.pop() {
        if expanded {
            post.push(block);
            continue;
        }
        if !visited.insert(block) {
            continue;
        }
        stack.push((block, true));
        let succs: Vec<BlockId> = program.block(block).end().successors().collect();
        // Pushed in reverse so the first successor is explored first.
        for s in succs.into_iter().rev() {
            if !visited.contains(&s) {
                stack.push((s, false));
            }
        }
    }
    post.reverse();
    post
}

impl Dominators {
    pub fn compute(program: &Program) -> Self {
        let rpo = reverse_postorder(program);
        let order: HashMap<BlockId, usize> = rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        const UNDEF: usize = usize::MAX;
        let mut idom = vec![UNDEF; rpo.len()];
        if !rpo.is_empty() {
            idom[0] = 0;
        }

        let intersect = |idom: &[usize], mut a: usize, mut b: usize| {
            while a != b {
                while a > b {
                    a = idom[a];
                }
                while b > a {
                    b = idom[b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..rpo.len() {
                let mut new_idom = UNDEF;
                for pred in program.block(rpo[i]).preds() {
                    let Some(&p) = order.get(pred) else {
                        continue;
                    };
                    if idom[p] == UNDEF {
                        continue;
                    }
                    new_idom = if new_idom == UNDEF {
                        p
                    } else {
                        intersect(&idom, p, new_idom)
                    };
                }
                if new_idom != UNDEF && idom[i] != new_idom {
                    idom[i] = new_idom;
                    changed = true;
                }
            }
        }

        Self { rpo, order, idom }
    }

    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.order.contains_key(&block)
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let &i = self.order.get(&block)?;
        if i == 0 {
            None
        } else {
            Some(self.rpo[self.idom[i]])
        }
    }

    /// Reflexive dominance between reachable blocks.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let (Some(&a), Some(&(mut b))) = (self.order.get(&a), self.order.get(&b)) else {
            return false;
        };
        loop {
            if a == b {
                return true;
            }
            if b == 0 || b < a {
                return false;
            }
            b = self.idom[b];
        }
    }
}
