//! Post-op fusion policy.
//!
//! Decides which post-op chains can be folded into the kernel store stage,
//! and where the clamp goes relative to the residual sum.
//!
//! | len | op has fused relu | accepted |
//! |---|---|---|
//! | 0 | any | yes |
//! | 1 | yes | sum |
//! | 1 | no | relu, or sum |
//! | 2 | yes | sum, relu |
//! | 2 | no | sum, relu / relu, sum |
//! | 3 | no | relu, sum, relu |

use crate::kernel_types::PostOps;
use crate::types::DataType;

/// Longest chain the store stage can absorb.
pub const MAX_POST_OPS: usize = 3;

/// Whether `post_ops` is fusible for an op that does (`with_eltwise`) or
/// does not carry its own relu.
pub fn post_ops_ok(post_ops: &PostOps, with_eltwise: bool) -> bool {
    let p = post_ops;
    match p.len() {
        0 => true,
        1 => {
            if with_eltwise {
                p.contain_sum(0)
            } else {
                p.is_relu(0) || p.contain_sum(0)
            }
        }
        2 => {
            if with_eltwise {
                p.contain_sum(0) && p.is_relu(1)
            } else {
                (p.contain_sum(0) && p.is_relu(1)) || (p.contain_sum(1) && p.is_relu(0))
            }
        }
        3 => !with_eltwise && p.is_relu(0) && p.contain_sum(1) && p.is_relu(2),
        _ => false,
    }
}

/// Where a clamp may be applied in the store stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampPosition {
    /// After scaling, before the residual sum.
    BeforeSum,
    /// After the residual sum, before requantization.
    AfterSum,
}

/// Whether the store stage clamps at `position`.
///
/// A u8 destination cannot hold negatives, so it forces a clamp after
/// whatever the last arithmetic step is.
pub fn maybe_relu(
    position: ClampPosition,
    post_ops: &PostOps,
    with_eltwise: bool,
    dst_dt: DataType,
) -> bool {
    let p = post_ops;
    match position {
        ClampPosition::BeforeSum => {
            with_eltwise || p.contain_eltwise(0) || (dst_dt == DataType::U8 && !p.contain_sum(0))
        }
        ClampPosition::AfterSum => {
            let sum_idx = if p.contain_sum(0) {
                0
            } else if p.contain_sum(1) {
                1
            } else {
                return false;
            };
            p.contain_eltwise(sum_idx + 1) || dst_dt == DataType::U8
        }
    }
}

/// How the residual sum is folded in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SumMode {
    /// `acc += dst`, used when the sum scale is exactly 1.
    PlainAdd,
    /// `acc += dst * scale`.
    Scaled(f32),
}

/// Resolved store-stage decisions for one kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpiloguePlan {
    pub relu_before_sum: bool,
    pub sum: Option<SumMode>,
    pub relu_after_sum: bool,
}

impl EpiloguePlan {
    /// Resolve the policy for an already validated chain.
    pub fn resolve(post_ops: &PostOps, with_eltwise: bool, dst_dt: DataType) -> Self {
        debug_assert!(post_ops_ok(post_ops, with_eltwise));
        let sum = post_ops.sum_scale().map(|scale| {
            if scale == 1.0 {
                SumMode::PlainAdd
            } else {
                SumMode::Scaled(scale)
            }
        });
        EpiloguePlan {
            relu_before_sum: maybe_relu(ClampPosition::BeforeSum, post_ops, with_eltwise, dst_dt),
            sum,
            relu_after_sum: maybe_relu(ClampPosition::AfterSum, post_ops, with_eltwise, dst_dt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_types::{EltwiseAlg, PostOp};

    fn relu() -> PostOp {
        PostOp::Eltwise { alg: EltwiseAlg::Relu, scale: 1.0, alpha: 0.0, beta: 0.0 }
    }
    fn sum() -> PostOp {
        PostOp::Sum { scale: 1.0 }
    }
    fn tanh() -> PostOp {
        PostOp::Eltwise { alg: EltwiseAlg::Tanh, scale: 1.0, alpha: 0.0, beta: 0.0 }
    }
    fn leaky() -> PostOp {
        PostOp::Eltwise { alg: EltwiseAlg::Relu, scale: 1.0, alpha: 0.2, beta: 0.0 }
    }
    fn ok(chain: Vec<PostOp>, with_eltwise: bool) -> bool {
        post_ops_ok(&PostOps::from(chain), with_eltwise)
    }

    #[test]
    fn test_policy_table_accepted() {
        assert!(ok(vec![], false));
        assert!(ok(vec![], true));
        assert!(ok(vec![sum()], true));
        assert!(ok(vec![relu()], false));
        assert!(ok(vec![sum()], false));
        assert!(ok(vec![sum(), relu()], true));
        assert!(ok(vec![sum(), relu()], false));
        assert!(ok(vec![relu(), sum()], false));
        assert!(ok(vec![relu(), sum(), relu()], false));
    }

    #[test]
    fn test_policy_table_rejected() {
        // length 1
        assert!(!ok(vec![relu()], true));
        assert!(!ok(vec![tanh()], false));
        assert!(!ok(vec![leaky()], false));
        // length 2
        assert!(!ok(vec![relu(), sum()], true));
        assert!(!ok(vec![relu(), relu()], false));
        assert!(!ok(vec![relu(), relu()], true));
        assert!(!ok(vec![sum(), sum()], false));
        assert!(!ok(vec![sum(), tanh()], false));
        assert!(!ok(vec![sum(), tanh()], true));
        // length 3
        assert!(!ok(vec![relu(), sum(), relu()], true));
        assert!(!ok(vec![sum(), relu(), relu()], false));
        assert!(!ok(vec![relu(), relu(), sum()], false));
        assert!(!ok(vec![relu(), sum(), tanh()], false));
        // length 4
        assert!(!ok(vec![relu(), sum(), relu(), relu()], false));
        assert!(!ok(vec![relu(), sum(), relu(), sum()], true));
    }

    #[test]
    fn test_clamp_positions() {
        let p = PostOps::from(vec![relu(), sum(), relu()]);
        assert!(maybe_relu(ClampPosition::BeforeSum, &p, false, DataType::S8));
        assert!(maybe_relu(ClampPosition::AfterSum, &p, false, DataType::S8));

        let p = PostOps::from(vec![sum()]);
        assert!(!maybe_relu(ClampPosition::BeforeSum, &p, false, DataType::S8));
        assert!(!maybe_relu(ClampPosition::AfterSum, &p, false, DataType::S8));
        // fused relu on the op clamps before the sum
        assert!(maybe_relu(ClampPosition::BeforeSum, &p, true, DataType::S8));
    }

    #[test]
    fn test_u8_destination_forces_trailing_clamp() {
        let empty = PostOps::new();
        assert!(maybe_relu(ClampPosition::BeforeSum, &empty, false, DataType::U8));
        assert!(!maybe_relu(ClampPosition::AfterSum, &empty, false, DataType::U8));

        let p = PostOps::from(vec![sum()]);
        assert!(!maybe_relu(ClampPosition::BeforeSum, &p, false, DataType::U8));
        assert!(maybe_relu(ClampPosition::AfterSum, &p, false, DataType::U8));

        assert!(!maybe_relu(ClampPosition::BeforeSum, &empty, false, DataType::F32));
    }

    #[test]
    fn test_epilogue_plan_sum_modes() {
        let plain = EpiloguePlan::resolve(&PostOps::from(vec![sum()]), false, DataType::F32);
        assert_eq!(plain.sum, Some(SumMode::PlainAdd));

        let scaled = EpiloguePlan::resolve(
            &PostOps::from(vec![PostOp::Sum { scale: 0.5 }, relu()]),
            false,
            DataType::S8,
        );
        assert_eq!(scaled.sum, Some(SumMode::Scaled(0.5)));
        assert!(!scaled.relu_before_sum);
        assert!(scaled.relu_after_sum);

        let none = EpiloguePlan::resolve(&PostOps::new(), false, DataType::S32);
        assert_eq!(none, EpiloguePlan { relu_before_sum: false, sum: None, relu_after_sum: false });
    }
}
