//! Graph traversal for the backward pass.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tg_tensor::Result;

use crate::tensor::{NodeId, Tensor};

/// Tracked tensors reachable from `root`, inputs before the tensors using them.
fn topological_sort(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn dfs(node: &Tensor, visited: &mut HashSet<NodeId>, order: &mut Vec<Tensor>) {
        if !visited.insert(node.id()) {
            return;
        }
        if let Some((_, inputs)) = node.recorded() {
            for input in inputs.iter().filter(|t| t.uses_grad()) {
                dfs(input, visited, order);
            }
        }
        order.push(node.clone());
    }

    dfs(root, &mut visited, &mut order);
    order
}

/// Propagates `seed` from `root` to every tracked tensor it depends on.
pub(crate) fn run_backward(root: &Tensor, seed: Tensor) -> Result<()> {
    let order = topological_sort(root);
    tracing::debug!(nodes = order.len(), "backward pass");

    let mut adjoints: HashMap<NodeId, Tensor> = HashMap::new();
    adjoints.insert(root.id(), seed);

    for node in order.iter().rev() {
        let Some(grad) = adjoints.remove(&node.id()) else {
            continue;
        };
        node.accumulate_grad(&grad)?;

        let Some((op, inputs)) = node.recorded() else {
            continue;
        };
        let contributions = op.backward(node, &inputs, &grad)?;
        for (input, contribution) in inputs.iter().zip(contributions) {
            let Some(contribution) = contribution else {
                continue;
            };
            match adjoints.entry(input.id()) {
                Entry::Occupied(mut e) => {
                    let sum = e.get().add(&contribution)?;
                    e.insert(sum);
                }
                Entry::Vacant(e) => {
                    e.insert(contribution);
                }
            }
        }
    }
    Ok(())
}
