use std::collections::HashSet;

use tracing::trace;

use super::{ScanError, ShardCursor};
use crate::chain::{BlockId, ChainClient};

/// Walks shard block parents back to the cursor
pub struct CatchUp<'a> {
    chain: &'a dyn ChainClient,
    max_depth: usize,
}

impl<'a> CatchUp<'a> {
    pub fn new(chain: &'a dyn ChainClient, max_depth: usize) -> Self {
        Self { chain, max_depth }
    }

    /// Unprocessed blocks leading up to `top`, every parent before its
    /// children
    ///
    /// `visited` is shared across the shard tops of one cycle, so blocks
    /// reachable from several tops (merges) come out once.
    pub async fn discover(
        &self,
        top: BlockId,
        cursor: &ShardCursor,
        visited: &mut HashSet<BlockId>,
    ) -> Result<Vec<BlockId>, ScanError> {
        let mut out = Vec::new();

        // (block, depth, parents already pushed)
        let mut stack = vec![(top, 0, false)];

        while let Some((block, depth, expanded)) = stack.pop() {
            if expanded {
                out.push(block);
                continue;
            }

            if cursor.is_seen(&block) || !visited.insert(block) {
                continue;
            }

            if depth > self.max_depth {
                return Err(ScanError::TraversalTooDeep { top, depth });
            }

            let parents = self.chain.block_parents(&block).await?;
            trace!(%block, parents = parents.len());

            stack.push((block, depth, true));
            for parent in parents.into_iter().rev() {
                stack.push((parent, depth + 1, false));
            }
        }

        Ok(out)
    }
}
