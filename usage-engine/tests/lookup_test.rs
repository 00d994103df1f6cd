//! Period lookups, usage summaries and event listing.

mod common;

use chrono::{Duration, Utc};
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use usage_engine::models::{
    DuplicateKey, DuplicateScope, ListEventsParams, Sign, TimeRange, UsageEvent,
};

fn billed(feature_id: &str, billable: Decimal, free: Decimal, cost: Decimal, period_id: u64) -> UsageEvent {
    UsageEvent {
        qty_total: billable + free,
        qty_billable: billable,
        qty_free_applied: free,
        cost,
        period_id,
        ..usage(feature_id, billable + free, at(1, 0))
    }
}

fn list_params() -> ListEventsParams {
    ListEventsParams {
        start_time: day0(),
        end_time: day0() + Duration::days(1),
        customer_id: None,
        subscription_id: None,
        meter_id: None,
        feature_id: None,
        price_id: None,
        offset: 0,
        limit: 0,
        count_total: false,
        latest_version_only: false,
    }
}

#[tokio::test]
async fn line_item_usage_nets_corrections() {
    let harness = MemoryHarness::new();
    let wrong = billed("api", dec!(40), dec!(10), dec!(4), 7);
    harness
        .seed(vec![
            billed("api", dec!(90), dec!(10), dec!(9), 7),
            wrong.clone(),
            retraction(&wrong),
            billed("api", dec!(500), Decimal::ZERO, dec!(50), 8),
        ])
        .await;

    let (billable, free) = harness
        .lookup
        .get_line_item_usage(&scope(), "line_api", 7)
        .await
        .unwrap();
    assert_eq!(billable, dec!(90));
    assert_eq!(free, dec!(10));
}

#[tokio::test]
async fn missing_period_is_zero() {
    let harness = MemoryHarness::new();

    let (billable, free) = harness
        .lookup
        .get_line_item_usage(&scope(), "line_api", 1)
        .await
        .unwrap();
    assert_eq!((billable, free), (Decimal::ZERO, Decimal::ZERO));

    let cost = harness
        .lookup
        .get_period_cost(&scope(), TEST_SUBSCRIPTION_ID, 1)
        .await
        .unwrap();
    assert_eq!(cost, Decimal::ZERO);
    assert!(harness
        .lookup
        .get_period_feature_totals(&scope(), TEST_SUBSCRIPTION_ID, 1)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn period_cost_and_feature_totals() {
    let harness = MemoryHarness::new();
    let voided = UsageEvent {
        sign: Some(Sign::Void),
        ..billed("api", dec!(1000), Decimal::ZERO, dec!(100), 3)
    };
    harness
        .seed(vec![
            billed("api", dec!(10), dec!(5), dec!(1.25), 3),
            billed("api", dec!(20), Decimal::ZERO, dec!(2.50), 3),
            billed("storage", dec!(7), dec!(3), dec!(0.70), 3),
            voided,
            UsageEvent {
                subscription_id: "sub_other".to_string(),
                ..billed("api", dec!(99), Decimal::ZERO, dec!(99), 3)
            },
        ])
        .await;

    let cost = harness
        .lookup
        .get_period_cost(&scope(), TEST_SUBSCRIPTION_ID, 3)
        .await
        .unwrap();
    assert_eq!(cost, dec!(4.45));

    let totals = harness
        .lookup
        .get_period_feature_totals(&scope(), TEST_SUBSCRIPTION_ID, 3)
        .await
        .unwrap();
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[0].feature_id, "api");
    assert_eq!(totals[0].quantity, dec!(30));
    assert_eq!(totals[0].free_units, dec!(5));
    assert_eq!(totals[0].cost, dec!(3.75));
    assert_eq!(totals[1].feature_id, "storage");
    assert_eq!(totals[1].quantity, dec!(7));
}

#[tokio::test]
async fn usage_by_subscription_is_keyed_by_line_item() {
    let harness = MemoryHarness::new();
    harness
        .seed(vec![
            usage("api", dec!(3), at(1, 0)),
            usage("api", dec!(4), at(2, 0)),
            usage("storage", dec!(10), at(1, 0)),
            UsageEvent {
                subscription_id: "sub_other".to_string(),
                ..usage("api", dec!(100), at(1, 0))
            },
        ])
        .await;

    let range = TimeRange::new(day0(), day0() + Duration::days(1)).unwrap();
    let usage_by_line = harness
        .lookup
        .get_usage_by_subscription(&scope(), TEST_SUBSCRIPTION_ID, None, &range)
        .await
        .unwrap();

    assert_eq!(usage_by_line.len(), 2);
    let api = &usage_by_line["line_api"];
    assert_eq!(api.sub_line_item_id.as_deref(), Some("line_api"));
    assert_eq!(api.feature_id, "api");
    assert_eq!(api.meter_id, "meter_api");
    assert_eq!(api.sum_total, dec!(7));
    assert_eq!(api.max_total, dec!(4));
    assert_eq!(api.latest_qty, dec!(4));
    assert_eq!(api.count_distinct_ids, 2);
    assert_eq!(api.count_unique_qty, 2);
    assert_eq!(usage_by_line["line_storage"].sum_total, dec!(10));
}

#[tokio::test]
async fn usage_by_costsheet_is_keyed_by_feature_meter_price() {
    let harness = MemoryHarness::new();
    harness
        .writer
        .bulk_append_cost(
            &scope(),
            vec![
                cost_usage("tokens", dec!(100), dec!(1), at(1, 0)),
                cost_usage("tokens", dec!(50), dec!(0.5), at(3, 0)),
            ],
        )
        .await
        .unwrap();

    let range = TimeRange::new(day0(), day0() + Duration::days(1)).unwrap();
    let by_key = harness
        .lookup
        .get_usage_by_costsheet(&scope(), TEST_COSTSHEET_ID, Some("ext_1"), &range)
        .await
        .unwrap();

    let tokens = &by_key["tokens:meter_tokens:price_tokens"];
    assert!(tokens.sub_line_item_id.is_none());
    assert_eq!(tokens.sum_total, dec!(150));
    assert_eq!(tokens.latest_qty, dec!(50));

    let none = harness
        .lookup
        .get_usage_by_costsheet(&scope(), TEST_COSTSHEET_ID, Some("ext_2"), &range)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn recent_usage_summary_orders_by_cost() {
    let harness = MemoryHarness::new();
    let now = Utc::now();
    let recent = |feature: &str, source: &str, qty: Decimal, cost: Decimal| UsageEvent {
        source: source.to_string(),
        cost,
        ..usage(feature, qty, now - Duration::minutes(30))
    };
    harness
        .seed(vec![
            recent("api", "web", dec!(10), dec!(1)),
            recent("api", "cli", dec!(5), dec!(3)),
            recent("storage", "web", dec!(2), dec!(2)),
            UsageEvent {
                cost: dec!(1000),
                ..usage("api", dec!(1), now - Duration::hours(12))
            },
        ])
        .await;

    let summary = harness
        .lookup
        .get_recent_usage_summary(&scope(), TEST_CUSTOMER_ID, None)
        .await
        .unwrap();

    let order: Vec<(&str, &str)> = summary
        .iter()
        .map(|s| (s.source.as_str(), s.feature_id.as_str()))
        .collect();
    assert_eq!(order, vec![("cli", "api"), ("web", "storage"), ("web", "api")]);
    assert_eq!(summary[2].usage, dec!(10));

    let wider = harness
        .lookup
        .get_recent_usage_summary(&scope(), TEST_CUSTOMER_ID, Some(Duration::hours(24)))
        .await
        .unwrap();
    assert_eq!(wider[0].cost, dec!(1000));
}

#[tokio::test]
async fn list_events_paginates_and_counts() {
    let harness = MemoryHarness::new();
    harness
        .seed((0..5).map(|i| usage("api", dec!(1), at(i, 0))).collect())
        .await;

    let params = ListEventsParams {
        offset: 1,
        limit: 2,
        count_total: true,
        ..list_params()
    };
    let page = harness.lookup.list_usage_events(&scope(), &params).await.unwrap();

    assert_eq!(page.total, Some(5));
    let times: Vec<_> = page.events.iter().map(|e| e.timestamp).collect();
    assert_eq!(times, vec![at(1, 0), at(2, 0)]);

    let bounded = ListEventsParams {
        end_time: at(3, 0),
        ..list_params()
    };
    let page = harness.lookup.list_usage_events(&scope(), &bounded).await.unwrap();
    assert_eq!(page.events.len(), 3);
    assert!(page.total.is_none());
}

#[tokio::test]
async fn list_events_latest_version_wins() {
    let harness = MemoryHarness::new();
    let original = UsageEvent {
        unique_hash: "h1".to_string(),
        ..usage("api", dec!(10), at(1, 0))
    };
    let restated = UsageEvent {
        id: "evt_restated".to_string(),
        qty_total: dec!(12),
        version: 3,
        ..original.clone()
    };
    harness
        .seed(vec![original, restated, usage("api", dec!(1), at(2, 0))])
        .await;

    let params = ListEventsParams {
        latest_version_only: true,
        count_total: true,
        ..list_params()
    };
    let page = harness.lookup.list_usage_events(&scope(), &params).await.unwrap();

    assert_eq!(page.total, Some(2));
    assert_eq!(page.events[0].id, "evt_restated");
    assert_eq!(page.events[0].qty_total, dec!(12));
}

#[tokio::test]
async fn list_events_rejects_inverted_range() {
    let harness = MemoryHarness::new();
    let params = ListEventsParams {
        start_time: at(5, 0),
        end_time: at(1, 0),
        ..list_params()
    };
    let err = harness.lookup.list_usage_events(&scope(), &params).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn duplicate_check_matches_sign_and_version() {
    let harness = MemoryHarness::new();
    let event = usage("api", dec!(1), at(1, 0));
    harness.seed(vec![event.clone()]).await;

    let key = |sign: Option<Sign>, version: Option<u64>| DuplicateKey {
        owner: DuplicateScope::Subscription(TEST_SUBSCRIPTION_ID.to_string()),
        meter_id: event.meter_id.clone(),
        period_id: event.period_id,
        unique_hash: event.unique_hash.clone(),
        sign,
        version,
    };

    assert!(harness.lookup.is_duplicate(&scope(), &key(None, None)).await.unwrap());
    assert!(harness
        .lookup
        .is_duplicate(&scope(), &key(Some(Sign::Assert), Some(0)))
        .await
        .unwrap());
    assert!(!harness
        .lookup
        .is_duplicate(&scope(), &key(Some(Sign::Retract), None))
        .await
        .unwrap());
    assert!(!harness
        .lookup
        .is_duplicate(&scope(), &key(None, Some(1)))
        .await
        .unwrap());

    let other_sheet = DuplicateKey {
        owner: DuplicateScope::CostSheet(TEST_COSTSHEET_ID.to_string()),
        ..key(None, None)
    };
    assert!(!harness.lookup.is_duplicate(&scope(), &other_sheet).await.unwrap());
}
