//! 订单链路测试套件
//!
//! OrderCreated -> PaymentAuthorized -> FulfillmentScheduled，
//! 以及支付失败后链路终止。

use crate::helpers::*;
use chrono::Duration;
use orderflow_shared::events::{EventType, OrderEvent, PaymentScenario};
use orderflow_shared::kafka::topics;
use orderflow_shared::lifecycle::OrderStatus;
use orderflow_shared::test_utils::{order_created, test_order_id};

#[cfg(test)]
mod success_path_tests {
    use super::*;

    /// 支付成功的订单最终被安排履约，ETA 为安排时间后 72 小时
    #[tokio::test]
    async fn test_authorized_order_is_scheduled() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();

        wait_for("FulfillmentScheduled", || {
            !envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).is_empty()
        })
        .await
        .unwrap();

        let authorized = envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id);
        assert_eq!(authorized.len(), 1);
        assert!(envelopes_for(&pipeline.log, topics::PAYMENT_FAILED, &order_id).is_empty());

        let scheduled = envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id);
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].event_type, EventType::FulfillmentScheduled.as_str());
        match OrderEvent::decode(&scheduled[0]).unwrap() {
            OrderEvent::FulfillmentScheduled(p) => {
                assert_eq!(p.eta_utc - p.scheduled_at, Duration::hours(72));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let order = fold_order(&pipeline.log, &order_id).unwrap();
        assert_eq!(order.status, OrderStatus::FulfillmentScheduled);

        pipeline.stop().await.unwrap();
    }

    /// 没有场景提示时，由确定性决策给出结果，两条链路互斥
    #[tokio::test]
    async fn test_unhinted_orders_take_exactly_one_branch() {
        let mut pipeline = Pipeline::started();
        let order_ids: Vec<String> = (0..10).map(|_| test_order_id()).collect();
        for order_id in &order_ids {
            pipeline
                .log
                .publish_event(&order_created(order_id, None))
                .await
                .unwrap();
        }

        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();
        wait_drained(&pipeline.log, FULFILLMENT_GROUP, topics::PAYMENT_AUTHORIZED)
            .await
            .unwrap();

        for order_id in &order_ids {
            let authorized = envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, order_id);
            let failed = envelopes_for(&pipeline.log, topics::PAYMENT_FAILED, order_id);
            let scheduled = envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, order_id);
            assert_eq!(authorized.len() + failed.len(), 1, "订单 {order_id} 必须恰好一个支付结果");
            assert_eq!(scheduled.len(), authorized.len());
        }

        pipeline.stop().await.unwrap();
    }
}

#[cfg(test)]
mod failure_path_tests {
    use super::*;

    /// 支付失败后不会出现 FulfillmentScheduled
    #[tokio::test]
    async fn test_declined_order_is_never_fulfilled() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Fail)))
            .await
            .unwrap();

        wait_for("PaymentFailed", || {
            !envelopes_for(&pipeline.log, topics::PAYMENT_FAILED, &order_id).is_empty()
        })
        .await
        .unwrap();
        settle().await;

        assert!(envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).is_empty());
        assert!(envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).is_empty());
        // fulfillment-worker 不订阅 PaymentFailed，账本里不会有记录
        assert_eq!(pipeline.fulfillment_ledger.processed_count(), 0);

        let failed = envelopes_for(&pipeline.log, topics::PAYMENT_FAILED, &order_id);
        match OrderEvent::decode(&failed[0]).unwrap() {
            OrderEvent::PaymentFailed(p) => assert!(!p.reason.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            fold_order(&pipeline.log, &order_id).unwrap().status,
            OrderStatus::PaymentFailed
        );

        pipeline.stop().await.unwrap();
    }
}

#[cfg(test)]
mod ordering_tests {
    use super::*;

    /// 同一订单的下游事件与上游同分区，顺序与上游一致
    #[tokio::test]
    async fn test_events_for_one_order_share_a_partition() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();

        wait_for("FulfillmentScheduled", || {
            !envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).is_empty()
        })
        .await
        .unwrap();

        let expected = pipeline.log.partition_for(&order_id);
        for topic in [
            topics::ORDER_CREATED,
            topics::PAYMENT_AUTHORIZED,
            topics::FULFILLMENT_SCHEDULED,
        ] {
            let records = pipeline.log.records(topic);
            let record = records
                .iter()
                .find(|m| m.key.as_deref() == Some(order_id.as_str()))
                .unwrap();
            assert_eq!(record.partition, expected, "{topic} 分区不一致");
        }

        pipeline.stop().await.unwrap();
    }

    /// 多个订单交错发布，每个订单各自得到一条完整链路
    #[tokio::test]
    async fn test_interleaved_orders_complete_independently() {
        let mut pipeline = Pipeline::started();
        let order_ids: Vec<String> = (0..6).map(|_| test_order_id()).collect();
        for order_id in &order_ids {
            pipeline
                .log
                .publish_event(&order_created(order_id, Some(PaymentScenario::Success)))
                .await
                .unwrap();
        }

        wait_for("全部订单安排履约", || {
            pipeline.log.records(topics::FULFILLMENT_SCHEDULED).len() == order_ids.len()
        })
        .await
        .unwrap();

        for order_id in &order_ids {
            let authorized = envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, order_id);
            let scheduled = envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, order_id);
            assert_eq!(scheduled[0].causation_id, Some(authorized[0].event_id));
            assert!(scheduled[0].occurred_at >= authorized[0].occurred_at);
        }

        pipeline.stop().await.unwrap();
    }
}
