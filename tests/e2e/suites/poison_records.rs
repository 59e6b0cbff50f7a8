//! 无法处理的记录测试套件
//!
//! 格式错误的记录写死信后提交，未知事件类型静默跳过，二者都不阻塞后续记录。

use std::collections::BTreeMap;

use crate::helpers::*;
use orderflow_shared::dlq::DeadLetterMessage;
use orderflow_shared::events::{PaymentScenario, headers};
use orderflow_shared::kafka::topics;
use orderflow_shared::test_utils::{order_created, test_order_id};
use serde_json::json;

fn typed_headers(event_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (headers::EVENT_TYPE.to_string(), event_type.to_string()),
        (headers::EVENT_VERSION.to_string(), "1".to_string()),
    ])
}

fn dead_letters(pipeline: &Pipeline) -> Vec<DeadLetterMessage> {
    pipeline
        .log
        .records(topics::DEAD_LETTER)
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect()
}

#[cfg(test)]
mod malformed_tests {
    use super::*;

    /// 无法解析的字节写入死信并提交，后续订单照常处理
    #[tokio::test]
    async fn test_garbage_bytes_go_to_dead_letter() {
        let mut pipeline = Pipeline::started();
        let key = test_order_id();
        pipeline
            .log
            .publish_raw(
                topics::ORDER_CREATED,
                &key,
                b"{not json".to_vec(),
                typed_headers("OrderCreated"),
            )
            .await
            .unwrap();

        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Success)))
            .await
            .unwrap();

        wait_for("死信写入", || !pipeline.log.records(topics::DEAD_LETTER).is_empty())
            .await
            .unwrap();
        wait_for("后续订单支付", || {
            !envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).is_empty()
        })
        .await
        .unwrap();
        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();

        let letters = dead_letters(&pipeline);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason_code, "MALFORMED_EVENT");
        assert_eq!(letters[0].consumer_group, PAYMENT_GROUP);
        assert_eq!(letters[0].source_topic, topics::ORDER_CREATED);
        assert_eq!(letters[0].payload, "{not json");
        // 格式错误的记录不进入账本
        assert_eq!(pipeline.payment_ledger.processed_count(), 1);

        pipeline.stop().await.unwrap();
    }

    /// 信封合法但负载校验失败，同样视为格式错误
    #[tokio::test]
    async fn test_invalid_payload_goes_to_dead_letter() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        let envelope = json!({
            "eventId": uuid::Uuid::now_v7(),
            "eventType": "OrderCreated",
            "eventVersion": 1,
            "occurredAt": chrono::Utc::now(),
            "correlationId": uuid::Uuid::now_v7(),
            "causationId": null,
            "payload": {
                "orderId": order_id,
                "customerEmail": "not-an-email",
                "productType": "book",
                "country": "germany",
                "createdAt": chrono::Utc::now(),
            }
        });
        pipeline
            .log
            .publish_raw(
                topics::ORDER_CREATED,
                &order_id,
                serde_json::to_vec(&envelope).unwrap(),
                typed_headers("OrderCreated"),
            )
            .await
            .unwrap();

        wait_for("死信写入", || !pipeline.log.records(topics::DEAD_LETTER).is_empty())
            .await
            .unwrap();
        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();

        let letters = dead_letters(&pipeline);
        assert_eq!(letters[0].reason_code, "MALFORMED_EVENT");
        assert!(envelopes_for(&pipeline.log, topics::PAYMENT_AUTHORIZED, &order_id).is_empty());
        assert!(envelopes_for(&pipeline.log, topics::PAYMENT_FAILED, &order_id).is_empty());

        pipeline.stop().await.unwrap();
    }
}

#[cfg(test)]
mod unknown_type_tests {
    use super::*;

    /// 未知事件类型跳过并提交，不写死信
    #[tokio::test]
    async fn test_unknown_type_is_skipped_silently() {
        let mut pipeline = Pipeline::started();
        let key = test_order_id();
        pipeline
            .log
            .publish_raw(
                topics::ORDER_CREATED,
                &key,
                br#"{"anything":"goes"}"#.to_vec(),
                typed_headers("OrderRefunded"),
            )
            .await
            .unwrap();

        let order_id = test_order_id();
        pipeline
            .log
            .publish_event(&order_created(&order_id, Some(PaymentScenario::Fail)))
            .await
            .unwrap();

        wait_for("后续订单支付", || {
            !envelopes_for(&pipeline.log, topics::PAYMENT_FAILED, &order_id).is_empty()
        })
        .await
        .unwrap();
        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();
        settle().await;

        assert!(pipeline.log.records(topics::DEAD_LETTER).is_empty());
        assert_eq!(pipeline.payment_ledger.processed_count(), 1);

        pipeline.stop().await.unwrap();
    }

    /// 高于当前支持版本的事件按未知类型处理
    #[tokio::test]
    async fn test_future_version_is_skipped_silently() {
        let mut pipeline = Pipeline::started();
        let order_id = test_order_id();
        let envelope = json!({
            "eventId": uuid::Uuid::now_v7(),
            "eventType": "OrderCreated",
            "eventVersion": 2,
            "occurredAt": chrono::Utc::now(),
            "correlationId": uuid::Uuid::now_v7(),
            "causationId": null,
            "payload": { "orderId": order_id }
        });
        pipeline
            .log
            .publish_raw(
                topics::ORDER_CREATED,
                &order_id,
                serde_json::to_vec(&envelope).unwrap(),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        wait_drained(&pipeline.log, PAYMENT_GROUP, topics::ORDER_CREATED)
            .await
            .unwrap();
        settle().await;

        assert!(pipeline.log.records(topics::DEAD_LETTER).is_empty());
        assert_eq!(pipeline.payment_ledger.processed_count(), 0);

        pipeline.stop().await.unwrap();
    }
}
