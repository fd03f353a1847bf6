use crate::models::{
    AccountPlan, BillingOption, BillingPlan, Campaign, CampaignLink, ClickEvent, Link, LinkFilter,
    Utm,
};
use crate::storage::{ClickBreakdown, QueuedMessage, Storage, StorageError, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const LINK_COLUMNS: &str =
    "l.id, l.short_code, l.long_url, l.description, l.account_id, l.created_at, l.hidden";

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives as long as its connections, so keep
        // exactly one open for the lifetime of the pool.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn owned_link_id(&self, account_id: i64, short_code: &str) -> StorageResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM links WHERE account_id = ? AND short_code = ?",
        )
        .bind(account_id)
        .bind(short_code)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or(StorageError::NotFound)
    }

    async fn plan_options(&self) -> Result<HashMap<i64, Vec<BillingOption>>> {
        let rows = sqlx::query_as::<_, (i64, String, String)>(
            "SELECT plan_id, name, value FROM billing_options ORDER BY id",
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        let mut options: HashMap<i64, Vec<BillingOption>> = HashMap::new();
        for (plan_id, name, value) in rows {
            options
                .entry(plan_id)
                .or_default()
                .push(BillingOption { name, value });
        }
        Ok(options)
    }
}

/// Case-sensitive prefix test with no wildcard characters
fn push_prefix_match(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, prefix: &str) {
    qb.push("substr(")
        .push(column)
        .push(", 1, length(")
        .push_bind(prefix.to_string())
        .push(")) = ")
        .push_bind(prefix.to_string());
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                short_code TEXT NOT NULL UNIQUE,
                long_url TEXT NOT NULL,
                description TEXT,
                account_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_links_account ON links(account_id)",
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                link_id INTEGER NOT NULL,
                tag TEXT NOT NULL,
                UNIQUE (link_id, tag)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS campaigns_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                link_id INTEGER NOT NULL,
                utm_source TEXT,
                utm_medium TEXT,
                utm_term TEXT,
                utm_content TEXT,
                UNIQUE (campaign_id, link_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS redirect_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                short_code TEXT NOT NULL,
                long_url TEXT NOT NULL,
                headers TEXT NOT NULL,
                country TEXT,
                ip_addr TEXT,
                referer TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_redirect_log_short ON redirect_log(short_code, timestamp)",
            r#"
            CREATE TABLE IF NOT EXISTS billing_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                price INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS billing_options (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plan_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE (plan_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS billing_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                plan_id INTEGER NOT NULL,
                start_at INTEGER NOT NULL,
                end_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_billing_accounts_active ON billing_accounts(active, account_id)",
            r#"
            CREATE TABLE IF NOT EXISTS role_permissions (
                role_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                PRIMARY KEY (role_id, permission)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS click_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'ready',
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                claimed_at INTEGER,
                consumer TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_click_queue_state ON click_queue(queue, state, id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(self.pool.as_ref()).await?;
        }

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_link(
        &self,
        account_id: i64,
        short_code: &str,
        long_url: &str,
        description: Option<&str>,
    ) -> StorageResult<Link> {
        let created_at = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO links (short_code, long_url, description, account_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(short_code) DO NOTHING
            "#,
        )
        .bind(short_code)
        .bind(long_url)
        .bind(description)
        .bind(account_id)
        .bind(created_at)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }

        let link = sqlx::query_as::<_, Link>(&format!(
            "SELECT {LINK_COLUMNS} FROM links l WHERE l.short_code = ?"
        ))
        .bind(short_code)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn delete_link(&self, account_id: i64, short_code: &str) -> StorageResult<i64> {
        let mut tx = self.pool.begin().await?;

        let link_id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM links WHERE account_id = ? AND short_code = ?",
        )
        .bind(account_id)
        .bind(short_code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::NotFound)?;

        sqlx::query("DELETE FROM tags WHERE link_id = ?")
            .bind(link_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM campaigns_links WHERE link_id = ?")
            .bind(link_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM links WHERE id = ?")
            .bind(link_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(link_id)
    }

    async fn find_link(&self, short_code: &str) -> Result<Option<Link>> {
        let link = sqlx::query_as::<_, Link>(&format!(
            "SELECT {LINK_COLUMNS} FROM links l WHERE l.short_code = ?"
        ))
        .bind(short_code)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn list_links(&self, account_id: i64, filter: &LinkFilter) -> Result<Vec<Link>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {LINK_COLUMNS} FROM links l WHERE l.account_id = "
        ));
        qb.push_bind(account_id);

        if !filter.tags.is_empty() {
            qb.push(" AND EXISTS (SELECT 1 FROM tags t WHERE t.link_id = l.id AND t.tag IN (");
            let mut tags = qb.separated(", ");
            for tag in &filter.tags {
                tags.push_bind(tag.clone());
            }
            qb.push("))");
        }

        for (column, prefixes) in [("l.short_code", &filter.short_url), ("l.long_url", &filter.long_url)] {
            if prefixes.is_empty() {
                continue;
            }
            qb.push(" AND (");
            for (i, prefix) in prefixes.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                push_prefix_match(&mut qb, column, prefix);
            }
            qb.push(")");
        }

        if let Some(text) = &filter.full_text {
            qb.push(" AND (EXISTS (SELECT 1 FROM tags t WHERE t.link_id = l.id AND t.tag = ")
                .push_bind(text.clone())
                .push(") OR ");
            push_prefix_match(&mut qb, "l.short_code", text);
            qb.push(" OR ");
            push_prefix_match(&mut qb, "l.long_url", text);
            qb.push(")");
        }

        qb.push(" ORDER BY l.id DESC");

        let links = qb
            .build_query_as::<Link>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(links)
    }

    async fn count_links(&self, account_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM links WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    async fn all_links(&self) -> Result<Vec<(String, String, i64)>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT short_code, long_url, account_id FROM links",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn hide_link(&self, account_id: i64, short_code: &str) -> StorageResult<()> {
        let result = sqlx::query("UPDATE links SET hidden = 1 WHERE account_id = ? AND short_code = ?")
            .bind(account_id)
            .bind(short_code)
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn add_tag(&self, account_id: i64, short_code: &str, tag: &str) -> StorageResult<()> {
        let link_id = self.owned_link_id(account_id, short_code).await?;

        sqlx::query("INSERT INTO tags (link_id, tag) VALUES (?, ?) ON CONFLICT(link_id, tag) DO NOTHING")
            .bind(link_id)
            .bind(tag)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn link_tags(&self, link_id: i64) -> Result<Vec<String>> {
        let tags = sqlx::query_scalar::<_, String>("SELECT tag FROM tags WHERE link_id = ? ORDER BY tag")
            .bind(link_id)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(tags)
    }

    async fn insert_click(&self, event: &ClickEvent, logged_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO redirect_log (short_code, long_url, headers, country, ip_addr, referer, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.short_code)
        .bind(&event.long_url)
        .bind(event.headers_json()?)
        .bind(&event.country)
        .bind(&event.ip)
        .bind(&event.referer)
        .bind(logged_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn total_clicks(&self, account_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM redirect_log r
            INNER JOIN links l ON l.short_code = r.short_code
            WHERE l.account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count)
    }

    async fn click_times(&self, account_id: i64, start: i64, end: i64) -> Result<Vec<i64>> {
        let times = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT r.timestamp FROM redirect_log r
            INNER JOIN links l ON l.short_code = r.short_code
            WHERE l.account_id = ? AND r.timestamp >= ? AND r.timestamp < ?
            "#,
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(times)
    }

    async fn link_breakdown(
        &self,
        short_code: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ClickBreakdown>> {
        let rows = sqlx::query_as::<_, ClickBreakdown>(
            r#"
            SELECT country, referer, COUNT(*) AS count FROM redirect_log
            WHERE short_code = ? AND timestamp >= ? AND timestamp < ?
            GROUP BY country, referer
            ORDER BY count DESC
            "#,
        )
        .bind(short_code)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn enqueue(&self, queue: &str, payload: &str) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO click_queue (queue, payload, enqueued_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(queue)
        .bind(payload)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn claim(
        &self,
        queue: &str,
        consumer: &str,
        limit: i64,
        visibility_timeout: i64,
    ) -> Result<Vec<QueuedMessage>> {
        let now = chrono::Utc::now().timestamp();

        let mut rows = sqlx::query_as::<_, QueuedMessage>(
            r#"
            UPDATE click_queue
            SET state = 'unacked', claimed_at = ?, consumer = ?
            WHERE id IN (
                SELECT id FROM click_queue
                WHERE queue = ?
                  AND (state = 'ready' OR (state = 'unacked' AND claimed_at < ?))
                ORDER BY id
                LIMIT ?
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(now)
        .bind(consumer)
        .bind(queue)
        .bind(now - visibility_timeout)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn ack(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM click_queue WHERE id = ?")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn reject(&self, id: i64, max_attempts: i64) -> Result<bool> {
        let state = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE click_queue
            SET attempts = attempts + 1,
                state = CASE WHEN attempts + 1 >= ? THEN 'rejected' ELSE 'ready' END,
                claimed_at = NULL,
                consumer = NULL
            WHERE id = ?
            RETURNING state
            "#,
        )
        .bind(max_attempts)
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(state.as_deref() == Some("rejected"))
    }

    async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let depth = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM click_queue WHERE queue = ? AND state IN ('ready', 'unacked')",
        )
        .bind(queue)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(depth)
    }

    async fn create_account(&self, name: &str) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO accounts (name, created_at) VALUES (?, ?) RETURNING id",
        )
        .bind(name)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn create_plan(&self, name: &str, price: i64, options: &[BillingOption]) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let plan_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO billing_plans (name, price) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET price = excluded.price
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(price)
        .fetch_one(&mut *tx)
        .await?;

        for option in options {
            sqlx::query(
                r#"
                INSERT INTO billing_options (plan_id, name, value) VALUES (?, ?, ?)
                ON CONFLICT(plan_id, name) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(plan_id)
            .bind(&option.name)
            .bind(&option.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(plan_id)
    }

    async fn find_plan(&self, name: &str) -> Result<Option<BillingPlan>> {
        let Some((id, name, price)) = sqlx::query_as::<_, (i64, String, i64)>(
            "SELECT id, name, price FROM billing_plans WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool.as_ref())
        .await?
        else {
            return Ok(None);
        };

        let options = sqlx::query_as::<_, (String, String)>(
            "SELECT name, value FROM billing_options WHERE plan_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(self.pool.as_ref())
        .await?
        .into_iter()
        .map(|(name, value)| BillingOption { name, value })
        .collect();

        Ok(Some(BillingPlan {
            id,
            name,
            price,
            options,
        }))
    }

    async fn apply_plan(&self, account_id: i64, plan_id: i64, start: i64, end: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE billing_accounts SET active = 0 WHERE account_id = ? AND active = 1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO billing_accounts (account_id, plan_id, start_at, end_at, active)
            VALUES (?, ?, ?, ?, 1)
            "#,
        )
        .bind(account_id)
        .bind(plan_id)
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn active_account_plans(&self) -> Result<Vec<AccountPlan>> {
        let rows = sqlx::query_as::<_, (i64, i64, String, i64, i64)>(
            r#"
            SELECT ba.account_id, ba.plan_id, p.name, ba.start_at, ba.end_at
            FROM billing_accounts ba
            INNER JOIN billing_plans p ON p.id = ba.plan_id
            WHERE ba.active = 1
            ORDER BY ba.account_id
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        let options = self.plan_options().await?;
        let plans = rows
            .into_iter()
            .map(|(account_id, plan_id, plan_name, start_at, end_at)| AccountPlan {
                account_id,
                plan_id,
                plan_name,
                start_at,
                end_at,
                options: options.get(&plan_id).cloned().unwrap_or_default(),
            })
            .collect();

        Ok(plans)
    }

    async fn create_campaign(
        &self,
        account_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Campaign> {
        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (account_id, name, description, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, account_id, name, description, created_at
            "#,
        )
        .bind(account_id)
        .bind(name)
        .bind(description)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(campaign)
    }

    async fn attach_to_campaign(
        &self,
        account_id: i64,
        campaign_id: i64,
        short_code: &str,
        utm: &Utm,
    ) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM campaigns WHERE id = ? AND account_id = ?")
            .bind(campaign_id)
            .bind(account_id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or(StorageError::NotFound)?;
        let link_id = self.owned_link_id(account_id, short_code).await?;

        sqlx::query(
            r#"
            INSERT INTO campaigns_links (campaign_id, link_id, utm_source, utm_medium, utm_term, utm_content)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(campaign_id, link_id) DO UPDATE SET
                utm_source = excluded.utm_source,
                utm_medium = excluded.utm_medium,
                utm_term = excluded.utm_term,
                utm_content = excluded.utm_content
            "#,
        )
        .bind(campaign_id)
        .bind(link_id)
        .bind(&utm.source)
        .bind(&utm.medium)
        .bind(&utm.term)
        .bind(&utm.content)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn campaign_links(&self, account_id: i64, campaign_id: i64) -> Result<Vec<CampaignLink>> {
        let links = sqlx::query_as::<_, CampaignLink>(
            r#"
            SELECT cl.campaign_id, l.short_code, cl.utm_source, cl.utm_medium, cl.utm_term, cl.utm_content
            FROM campaigns c
            INNER JOIN campaigns_links cl ON cl.campaign_id = c.id
            INNER JOIN links l ON l.id = cl.link_id
            WHERE c.account_id = ? AND c.id = ?
            ORDER BY l.id
            "#,
        )
        .bind(account_id)
        .bind(campaign_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(links)
    }

    async fn grant_permission(&self, role_id: i64, permission: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(permission)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn role_has_permission(&self, role_id: i64, permission: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM role_permissions WHERE role_id = ? AND permission = ?",
        )
        .bind(role_id)
        .bind(permission)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count > 0)
    }
}
