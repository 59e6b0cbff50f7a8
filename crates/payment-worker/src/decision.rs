//! 支付决策
//!
//! 下单事件携带支付场景提示时直接按提示决定结果；否则使用基于订单 ID 的确定性规则，
//! 同一订单无论重投多少次都会得到相同结论。该规则是真实支付授权调用的占位实现。

use orderflow_shared::events::{OrderCreated, PaymentScenario};
use sha2::{Digest, Sha256};

/// 支付决策结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentDecision {
    Authorized { authorization_id: String },
    Declined { reason: String },
}

/// 默认批准比例
pub const DEFAULT_APPROVAL_RATE_PERCENT: u8 = 80;

#[derive(Debug, Clone)]
pub struct PaymentDecider {
    approval_rate_percent: u8,
}

impl Default for PaymentDecider {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_RATE_PERCENT)
    }
}

impl PaymentDecider {
    pub fn new(approval_rate_percent: u8) -> Self {
        Self {
            approval_rate_percent: approval_rate_percent.min(100),
        }
    }

    pub fn decide(&self, order: &OrderCreated) -> PaymentDecision {
        let approved = match order.payment_scenario {
            Some(PaymentScenario::Success) => true,
            Some(PaymentScenario::Fail) => {
                return PaymentDecision::Declined {
                    reason: "payment declined by scenario hint".to_string(),
                };
            }
            None => self.approves(&order.order_id),
        };

        if approved {
            PaymentDecision::Authorized {
                authorization_id: authorization_id(&order.order_id),
            }
        } else {
            PaymentDecision::Declined {
                reason: "payment declined by issuer".to_string(),
            }
        }
    }

    /// SHA-256(orderId) 首字节对 100 取模，小于批准比例即批准
    pub fn approves(&self, order_id: &str) -> bool {
        let digest = Sha256::digest(order_id.as_bytes());
        digest[0] % 100 < self.approval_rate_percent
    }
}

/// 授权号由订单 ID 派生，重投时保持不变
fn authorization_id(order_id: &str) -> String {
    let digest = Sha256::digest(format!("authorization:{order_id}").as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("auth-{hex}")
}
