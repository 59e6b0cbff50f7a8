//! 关联 ID / 因果 ID 传递测试套件

use crate::helpers::*;
use orderflow_shared::events::{PaymentScenario, headers};
use orderflow_shared::kafka::topics;
use orderflow_shared::test_utils::{order_created, test_order_id};

#[cfg(test)]
mod propagation_tests {
    use super::*;

    /// 整条链路共享根事件的关联 ID，因果 ID 逐跳指向直接上游
    #[tokio::test]
    async fn test_chain_shares_correlation_and_links_causation() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        let root = pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();

        wait_for("FulfillmentScheduled", || {
            !envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).is_empty()
        })
        .await
        .unwrap();

        let authorized = envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id)
            .remove(0);
        let scheduled = envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id)
            .remove(0);

        assert!(root.is_root());
        assert_eq!(root.correlation_id, root.event_id);

        assert_eq!(authorized.correlation_id, root.correlation_id);
        assert_eq!(authorized.causation_id, Some(root.event_id));

        assert_eq!(scheduled.correlation_id, root.correlation_id);
        assert_eq!(scheduled.causation_id, Some(authorized.event_id));

        // 每一跳都是新事件
        assert_ne!(authorized.event_id, root.event_id);
        assert_ne!(scheduled.event_id, authorized.event_id);

        pipeline.stop().await.unwrap();
    }

    /// 记录 header 与信封中的链路字段一致
    #[tokio::test]
    async fn test_headers_mirror_envelope() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        let root = pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();

        wait_for("PaymentAuthorized", || {
            !envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).is_empty()
        })
        .await
        .unwrap();

        let record = pipeline
            .log
            .records(topics::PAYMENT_AUTHORIZED)
            .into_iter()
            .find(|m| m.key.as_deref() == Some(order_id.as_str()))
            .unwrap();
        assert_eq!(
            record.header(headers::CORRELATION_ID),
            Some(root.correlation_id.to_string().as_str())
        );
        assert_eq!(record.header(headers::EVENT_TYPE), Some("PaymentAuthorized"));

        let envelope = envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id)
            .remove(0);
        assert_eq!(
            record.header(headers::EVENT_ID),
            Some(envelope.event_id.to_string().as_str())
        );

        pipeline.stop().await.unwrap();
    }

    /// 不同订单的链路关联 ID 互不相同
    #[tokio::test]
    async fn test_distinct_orders_have_distinct_correlation() {
        let mut pipeline = Pipeline::started();
        let first = test_order_id();
        let second = test_order_id();
        for order_id in [&first, &second] {
            pipeline
                .log
                .publish_event(&order_created(order_id, Some(PaymentScenario::Success)))
                .await
                .unwrap();
        }

        wait_for("两条链路完成", || {
            pipeline.log.records(topics::FULFILLMENT_SCHEDULED).len() == 2
        })
        .await
        .unwrap();

        let a = envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &first).remove(0);
        let b = envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &second).remove(0);
        assert_ne!(a.correlation_id, b.correlation_id);

        pipeline.stop().await.unwrap();
    }
}
