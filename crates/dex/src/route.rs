//! Recursive swap route tree.
//!
//! A route is an immutable value: a leaf swaps along a token path on one
//! venue, a split divides the input across weighted sub-routes, and a
//! sequence chains sub-routes so each one consumes the previous output.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Route validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route is empty")]
    Empty,

    #[error("split shares sum to zero")]
    ZeroShares,

    #[error("leg path must contain at least two tokens, got {0}")]
    ShortPath(usize),

    #[error("route starts at {actual}, expected {expected}")]
    WrongInput { expected: Address, actual: Address },

    #[error("route ends at {actual}, expected {expected}")]
    WrongOutput { expected: Address, actual: Address },

    #[error("split branches disagree on endpoints")]
    InconsistentSplit,

    #[error("sequence hop {index} starts at {actual}, previous hop ended at {expected}")]
    BrokenSequence {
        index: usize,
        expected: Address,
        actual: Address,
    },
}

/// A single venue swap along a token path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    /// Registered venue identifier
    pub venue: String,
    /// Token path, first is input and last is output
    pub path: SmallVec<[Address; 4]>,
}

/// Route tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteNode {
    Leg(Leg),
    /// Weighted split of the input amount; each branch must share endpoints
    Split(Vec<(u32, RouteNode)>),
    /// Sub-routes executed one after another
    Sequence(Vec<RouteNode>),
}

impl RouteNode {
    /// Direct single-venue swap.
    pub fn leg(venue: impl Into<String>, token_in: Address, token_out: Address) -> Self {
        let mut path = SmallVec::new();
        path.push(token_in);
        path.push(token_out);
        Self::Leg(Leg {
            venue: venue.into(),
            path,
        })
    }

    /// Multi-hop single-venue swap.
    pub fn path(venue: impl Into<String>, path: impl IntoIterator<Item = Address>) -> Self {
        Self::Leg(Leg {
            venue: venue.into(),
            path: path.into_iter().collect(),
        })
    }

    /// Validate structure and return the `(input, output)` endpoints.
    pub fn endpoints(&self) -> Result<(Address, Address), RouteError> {
        match self {
            Self::Leg(leg) => match (leg.path.first(), leg.path.last()) {
                (Some(first), Some(last)) if leg.path.len() >= 2 => Ok((*first, *last)),
                _ => Err(RouteError::ShortPath(leg.path.len())),
            },
            Self::Split(branches) => {
                if branches.is_empty() {
                    return Err(RouteError::Empty);
                }
                if total_shares(branches) == 0 {
                    return Err(RouteError::ZeroShares);
                }
                let mut endpoints = None;
                for (_, branch) in branches {
                    let current = branch.endpoints()?;
                    match endpoints {
                        None => endpoints = Some(current),
                        Some(seen) if seen != current => {
                            return Err(RouteError::InconsistentSplit)
                        }
                        Some(_) => {}
                    }
                }
                endpoints.ok_or(RouteError::Empty)
            }
            Self::Sequence(hops) => {
                let mut iter = hops.iter().enumerate();
                let (_, first) = iter.next().ok_or(RouteError::Empty)?;
                let (start, mut end) = first.endpoints()?;
                for (index, hop) in iter {
                    let (hop_in, hop_out) = hop.endpoints()?;
                    if hop_in != end {
                        return Err(RouteError::BrokenSequence {
                            index,
                            expected: end,
                            actual: hop_in,
                        });
                    }
                    end = hop_out;
                }
                Ok((start, end))
            }
        }
    }

    /// Validate the tree against the expected endpoints.
    pub fn validate(&self, token_in: Address, token_out: Address) -> Result<(), RouteError> {
        let (start, end) = self.endpoints()?;
        if start != token_in {
            return Err(RouteError::WrongInput {
                expected: token_in,
                actual: start,
            });
        }
        if end != token_out {
            return Err(RouteError::WrongOutput {
                expected: token_out,
                actual: end,
            });
        }
        Ok(())
    }

    /// Number of venue legs in the tree.
    pub fn leg_count(&self) -> usize {
        match self {
            Self::Leg(_) => 1,
            Self::Split(branches) => branches.iter().map(|(_, b)| b.leg_count()).sum(),
            Self::Sequence(hops) => hops.iter().map(RouteNode::leg_count).sum(),
        }
    }
}

/// Sum of split weights, widened to avoid overflow.
pub(crate) fn total_shares(branches: &[(u32, RouteNode)]) -> u64 {
    branches.iter().map(|(share, _)| u64::from(*share)).sum()
}

/// Divide `amount` across the split weights. Each branch but the last gets
/// its floor share; the last takes the remainder so nothing is lost.
pub(crate) fn split_amounts(amount: U256, branches: &[(u32, RouteNode)]) -> Vec<U256> {
    let total = U256::from(total_shares(branches));
    let mut remaining = amount;
    let last = branches.len().saturating_sub(1);
    branches
        .iter()
        .enumerate()
        .map(|(i, (share, _))| {
            if i == last {
                remaining
            } else {
                let part = amount * U256::from(*share) / total;
                remaining -= part;
                part
            }
        })
        .collect()
}
