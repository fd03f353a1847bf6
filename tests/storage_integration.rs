//! Relational store behaviour against in-memory SQLite.

use shortly::models::{BillingOption, ClickEvent, LinkFilter, Utm};
use shortly::storage::{SqliteStorage, Storage, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn click(short_code: &str, referer: &str, country: Option<&str>) -> ClickEvent {
    ClickEvent {
        short_code: short_code.to_string(),
        long_url: "https://example.com".to_string(),
        ip: Some("8.8.8.8".to_string()),
        country: country.map(str::to_string),
        referer: referer.to_string(),
        headers: BTreeMap::from([("user-agent".to_string(), vec!["curl/8".to_string()])]),
        observed_at: 1_700_000_000,
    }
}

#[tokio::test]
async fn test_short_codes_are_unique() {
    let storage = create_test_storage().await;
    storage.create_link(1, "abcde", "https://a.example", None).await.unwrap();

    let err = storage
        .create_link(2, "abcde", "https://b.example", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict));
    assert_eq!(
        storage.find_link("abcde").await.unwrap().unwrap().long_url,
        "https://a.example"
    );
}

#[tokio::test]
async fn test_delete_is_scoped_to_owner() {
    let storage = create_test_storage().await;
    storage.create_link(1, "mine1", "https://a.example", None).await.unwrap();
    storage.add_tag(1, "mine1", "x").await.unwrap();

    assert!(matches!(
        storage.delete_link(2, "mine1").await,
        Err(StorageError::NotFound)
    ));
    storage.delete_link(1, "mine1").await.unwrap();
    assert!(storage.find_link("mine1").await.unwrap().is_none());
    assert_eq!(storage.count_links(1).await.unwrap(), 0);
}

#[tokio::test]
async fn test_list_filters() {
    let storage = create_test_storage().await;
    storage.create_link(1, "aa111", "https://shop.example/a", None).await.unwrap();
    storage.create_link(1, "ab222", "https://blog.example/b", None).await.unwrap();
    storage.create_link(1, "zz333", "https://shop.example/c", None).await.unwrap();
    storage.create_link(2, "aa444", "https://shop.example/d", None).await.unwrap();
    storage.add_tag(1, "zz333", "sale").await.unwrap();

    let codes = |links: Vec<shortly::models::Link>| {
        let mut codes: Vec<String> = links.into_iter().map(|l| l.short_code).collect();
        codes.sort();
        codes
    };

    let all = storage.list_links(1, &LinkFilter::default()).await.unwrap();
    assert_eq!(codes(all), vec!["aa111", "ab222", "zz333"]);

    let by_short = LinkFilter::from_query("shortUrl=aa&shortUrl=ab");
    assert_eq!(
        codes(storage.list_links(1, &by_short).await.unwrap()),
        vec!["aa111", "ab222"]
    );

    let short_and_long = LinkFilter::from_query("shortUrl=a&longUrl=https://shop");
    assert_eq!(
        codes(storage.list_links(1, &short_and_long).await.unwrap()),
        vec!["aa111"]
    );

    let by_tag = LinkFilter::from_query("tags=sale");
    assert_eq!(codes(storage.list_links(1, &by_tag).await.unwrap()), vec!["zz333"]);

    let full_text = LinkFilter::from_query("fullText=sale");
    assert_eq!(codes(storage.list_links(1, &full_text).await.unwrap()), vec!["zz333"]);
}

#[tokio::test]
async fn test_prefix_filters_are_exact() {
    let storage = create_test_storage().await;
    storage.create_link(1, "abc12", "https://Shop.example/a", None).await.unwrap();
    storage.create_link(1, "ABC34", "https://shop.example/b", None).await.unwrap();
    storage.create_link(1, "a_x99", "https://50%.example/c", None).await.unwrap();

    let codes = |links: Vec<shortly::models::Link>| {
        let mut codes: Vec<String> = links.into_iter().map(|l| l.short_code).collect();
        codes.sort();
        codes
    };
    let list = |query: &str| {
        let storage = storage.clone();
        let filter = LinkFilter::from_query(query);
        async move { codes(storage.list_links(1, &filter).await.unwrap()) }
    };

    assert_eq!(list("shortUrl=abc").await, vec!["abc12"]);
    assert_eq!(list("shortUrl=ABC").await, vec!["ABC34"]);
    assert_eq!(list("shortUrl=a_").await, vec!["a_x99"]);
    assert_eq!(list("shortUrl=a%25").await, Vec::<String>::new());
    assert_eq!(list("longUrl=https://shop").await, vec!["ABC34"]);
    assert_eq!(list("fullText=https://50%25").await, vec!["a_x99"]);
    assert_eq!(list("fullText=ab").await, vec!["abc12"]);
}

#[tokio::test]
async fn test_click_log_queries() {
    let storage = create_test_storage().await;
    storage.create_link(1, "cl001", "https://example.com", None).await.unwrap();

    storage.insert_click(&click("cl001", "https://a.example", Some("DE")), 1000).await.unwrap();
    storage.insert_click(&click("cl001", "https://a.example", Some("DE")), 2000).await.unwrap();
    storage.insert_click(&click("cl001", "", None), 3000).await.unwrap();

    assert_eq!(storage.total_clicks(1).await.unwrap(), 3);
    assert_eq!(storage.total_clicks(2).await.unwrap(), 0);
    assert_eq!(storage.click_times(1, 1000, 3000).await.unwrap(), vec![1000, 2000]);

    let breakdown = storage.link_breakdown("cl001", 0, 10_000).await.unwrap();
    assert_eq!(breakdown.len(), 2);
    assert_eq!(breakdown[0].count, 2);
    assert_eq!(breakdown[0].country.as_deref(), Some("DE"));
}

#[tokio::test]
async fn test_queue_claim_ack_reject() {
    let storage = create_test_storage().await;
    let first = storage.enqueue("redirects", "one").await.unwrap();
    storage.enqueue("redirects", "two").await.unwrap();
    storage.enqueue("other", "three").await.unwrap();

    let claimed = storage.claim("redirects", "c1", 10, 30).await.unwrap();
    assert_eq!(
        claimed.iter().map(|m| m.payload.as_str()).collect::<Vec<_>>(),
        vec!["one", "two"]
    );
    assert!(storage.claim("redirects", "c2", 10, 30).await.unwrap().is_empty());
    assert_eq!(storage.queue_depth("redirects").await.unwrap(), 2);

    storage.ack(first).await.unwrap();
    assert!(!storage.reject(claimed[1].id, 2).await.unwrap());
    let again = storage.claim("redirects", "c2", 10, 30).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempts, 1);

    assert!(storage.reject(again[0].id, 2).await.unwrap());
    assert_eq!(storage.queue_depth("redirects").await.unwrap(), 0);
}

#[tokio::test]
async fn test_plans_and_account_plans() {
    let storage = create_test_storage().await;
    let account = storage.create_account("acme").await.unwrap();
    let free = storage
        .create_plan("free", 0, &[BillingOption::new("url_limit", 5)])
        .await
        .unwrap();
    let pro = storage
        .create_plan(
            "pro",
            900,
            &[
                BillingOption::new("url_limit", 500),
                BillingOption::new("timedata_limit", 365),
            ],
        )
        .await
        .unwrap();

    storage.apply_plan(account, free, 0, 100).await.unwrap();
    storage.apply_plan(account, pro, 100, 200).await.unwrap();

    let active = storage.active_account_plans().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].plan_name, "pro");
    assert_eq!(active[0].options.len(), 2);
    assert!(active[0].is_expired(201));

    let found = storage.find_plan("free").await.unwrap().unwrap();
    assert_eq!(found.options, vec![BillingOption::new("url_limit", "5")]);
    assert!(storage.find_plan("gold").await.unwrap().is_none());
}

#[tokio::test]
async fn test_campaigns_are_scoped_to_owner() {
    let storage = create_test_storage().await;
    storage.create_link(1, "cmp01", "https://example.com", None).await.unwrap();
    storage.create_link(2, "cmp02", "https://example.com", None).await.unwrap();
    let campaign = storage.create_campaign(1, "launch", Some("q3")).await.unwrap();

    let utm = Utm {
        source: Some("mail".to_string()),
        medium: Some("email".to_string()),
        ..Utm::default()
    };
    storage.attach_to_campaign(1, campaign.id, "cmp01", &utm).await.unwrap();
    assert!(matches!(
        storage.attach_to_campaign(1, campaign.id, "cmp02", &utm).await,
        Err(StorageError::NotFound)
    ));
    assert!(matches!(
        storage.attach_to_campaign(2, campaign.id, "cmp02", &utm).await,
        Err(StorageError::NotFound)
    ));

    let links = storage.campaign_links(1, campaign.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].short_code, "cmp01");
    assert_eq!(links[0].utm_source.as_deref(), Some("mail"));
    assert!(storage.campaign_links(2, campaign.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_role_permissions() {
    let storage = create_test_storage().await;
    assert!(!storage.role_has_permission(3, "links:read").await.unwrap());
    storage.grant_permission(3, "links:read").await.unwrap();
    storage.grant_permission(3, "links:read").await.unwrap();
    assert!(storage.role_has_permission(3, "links:read").await.unwrap());
    assert!(!storage.role_has_permission(3, "links:write").await.unwrap());
}
