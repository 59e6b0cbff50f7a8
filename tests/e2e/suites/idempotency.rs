//! 幂等测试套件
//!
//! 重复投递、发布失败、账本故障、重启恢复都不能产生第二次可观察副作用。

use crate::helpers::*;
use orderflow_shared::events::PaymentScenario;
use orderflow_shared::kafka::topics;
use orderflow_shared::test_utils::{order_created, test_order_id};

#[cfg(test)]
mod duplicate_delivery_tests {
    use super::*;

    /// 同一 OrderCreated 投递两次，只产生一次支付结果
    #[tokio::test]
    async fn test_redelivered_order_created_is_absorbed() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        let root = pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();
        pipeline.log.publish_envelope(&root).await.unwrap();

        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();
        wait_drained(&pipeline.log, FULFILLMENT_GROUP, topics::PAYMENT_AUTHORIZED)
            .await
            .unwrap();

        assert_eq!(pipeline.log.records(topics::ORDER_CREATED).len(), 2);
        assert_eq!(
            envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).len(),
            1
        );
        assert_eq!(
            envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).len(),
            1
        );
        assert!(pipeline.payment_ledger.contains(root.event_id));
        assert_eq!(pipeline.payment_ledger.processed_count(), 1);

        pipeline.stop().await.unwrap();
    }

    /// 下游 PaymentAuthorized 重复投递，只安排一次履约
    #[tokio::test]
    async fn test_redelivered_payment_authorized_is_absorbed() {
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

        let authorized = envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id)
            .remove(0);
        pipeline.log.publish_envelope(&authorized).await.unwrap();
        wait_drained(&pipeline.log, FULFILLMENT_GROUP, topics::PAYMENT_AUTHORIZED)
            .await
            .unwrap();

        assert_eq!(
            envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).len(),
            1
        );
        assert_eq!(pipeline.fulfillment_ledger.processed_count(), 1);

        pipeline.stop().await.unwrap();
    }

    /// 重启后从已提交位置继续，重放的旧事件仍被账本吸收
    #[tokio::test]
    async fn test_restart_does_not_repeat_side_effects() {
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

        pipeline.restart().await.unwrap();
        pipeline.log.publish_envelope(&root).await.unwrap();
        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).len(),
            1
        );
        assert_eq!(
            envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).len(),
            1
        );

        pipeline.stop().await.unwrap();
    }
}

#[cfg(test)]
mod fault_injection_tests {
    use super::*;

    /// 发布失败时不提交，重投后补发发件箱，下游只看到一条事件
    #[tokio::test]
    async fn test_publish_failure_is_retried_without_duplicates() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();
        // worker 尚未被调度，下一次发布必然来自 payment-worker
        pipeline.log.fail_next_publishes(2);

        wait_for("FulfillmentScheduled", || {
            !envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).is_empty()
        })
        .await
        .unwrap();
        wait_drained(&pipeline.log, FULFILLMENT_GROUP, topics::PAYMENT_AUTHORIZED)
            .await
            .unwrap();

        assert_eq!(
            envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).len(),
            1
        );
        assert_eq!(pipeline.payment_ledger.processed_count(), 1);
        assert_eq!(pipeline.payment_ledger.pending_count(), 0);
        assert_eq!(pipeline.log.lag(PAYMENT_GROUP, topics::ORDER_CREATED), 0);

        pipeline.stop().await.unwrap();
    }

    /// 一个订单持续发布失败时，其他分区上的订单照常走完链路
    #[tokio::test]
    async fn test_stuck_order_does_not_block_other_partitions() {
        let mut pipeline = Pipeline::default();
        let stuck = test_order_id();
        let healthy = std::iter::repeat_with(test_order_id)
            .find(|id| pipeline.log.partition_for(id) != pipeline.log.partition_for(&stuck))
            .unwrap();
        for order_id in [&stuck, &healthy] {
            pipeline
                .log
                .publish_event(&order_created(order_id, Some(PaymentScenario::Success)))
                .await
                .unwrap();
        }
        pipeline.log.fail_publishes_for_key(&stuck);
        pipeline.start();

        wait_for("健康订单的 FulfillmentScheduled", || {
            !envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &healthy).is_empty()
        })
        .await
        .unwrap();
        wait_for("卡住订单的发件箱记录", || pipeline.payment_ledger.pending_count() == 1)
            .await
            .unwrap();
        assert!(envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &stuck).is_empty());
        assert_eq!(pipeline.log.lag(PAYMENT_GROUP, topics::ORDER_CREATED), 1);

        pipeline.log.recover_key(&stuck);
        wait_for("恢复后的 FulfillmentScheduled", || {
            !envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &stuck).is_empty()
        })
        .await
        .unwrap();
        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();
        assert_eq!(
            envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &stuck).len(),
            1
        );
        assert_eq!(pipeline.payment_ledger.pending_count(), 0);

        pipeline.stop().await.unwrap();
    }

    /// 账本写入失败时不产生任何下游事件，恢复后正常处理
    #[tokio::test]
    async fn test_ledger_write_failure_delays_but_does_not_lose() {
        let mut pipeline = Pipeline::default();
        pipeline.payment_ledger.fail_next_records(3);
        pipeline.start();

        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();

        wait_for("PaymentAuthorized", || {
            !envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).is_empty()
        })
        .await
        .unwrap();
        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();

        assert_eq!(
            envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).len(),
            1
        );
        assert_eq!(pipeline.payment_ledger.processed_count(), 1);

        pipeline.stop().await.unwrap();
    }

    /// 账本读取失败同样按瞬时故障处理
    #[tokio::test]
    async fn test_ledger_lookup_failure_is_retried() {
        let mut pipeline = Pipeline::default();
        pipeline.fulfillment_ledger.fail_next_lookups(2);
        pipeline.start();

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
        assert_eq!(
            envelopes_for(&pipeline.log, topics::FULFILLMENT_SCHEDULED, &order_id).len(),
            1
        );

        pipeline.stop().await.unwrap();
    }
}
