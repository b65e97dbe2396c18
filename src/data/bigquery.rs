//! BigQuery adapter over the v2 REST API.
//!
//! Queries run through `jobs.query` with named standard-SQL parameters and
//! follow `getQueryResults` for slow jobs and extra pages. Cells arrive as
//! `{"f": [{"v": ...}]}` with every scalar encoded as a string.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::gcp::GcpAuth;

use super::models::{
    AsinAov, CampaignBudgetStatus, EntityId, KeywordBid, KeywordPerformance, SearchTermCandidate,
};
use super::repository::{MetricsRepository, RepositoryError};

const BIGQUERY_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const QUERY_TIMEOUT_MS: u64 = 20_000;
const MAX_INCOMPLETE_POLLS: u32 = 15;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<WireRow>,
    page_token: Option<String>,
    job_reference: Option<JobReference>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableSchema {
    fields: Vec<SchemaField>,
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    f: Vec<WireCell>,
}

#[derive(Debug, Deserialize)]
struct WireCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

/// A named standard-SQL query parameter.
#[derive(Debug, Clone)]
pub enum QueryParam {
    Int(&'static str, i64),
    Numeric(&'static str, Decimal),
    Str(&'static str, String),
}

impl QueryParam {
    fn to_wire(&self) -> Value {
        let (name, kind, value) = match self {
            QueryParam::Int(name, v) => (name, "INT64", v.to_string()),
            QueryParam::Numeric(name, v) => (name, "NUMERIC", v.to_string()),
            QueryParam::Str(name, v) => (name, "STRING", v.clone()),
        };
        json!({
            "name": name,
            "parameterType": { "type": kind },
            "parameterValue": { "value": value },
        })
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One result row, cells addressed by column name.
#[derive(Debug, Clone, Default)]
pub struct Row(HashMap<String, Value>);

impl Row {
    fn raw(&self, column: &str) -> Option<&str> {
        match self.0.get(column) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn string(&self, column: &str) -> Result<String, RepositoryError> {
        self.raw(column)
            .map(str::to_string)
            .ok_or_else(|| RepositoryError::Decode(format!("missing column {column}")))
    }

    pub fn opt_string(&self, column: &str) -> Option<String> {
        self.raw(column).filter(|s| !s.is_empty()).map(str::to_string)
    }

    pub fn entity(&self, column: &str) -> Result<EntityId, RepositoryError> {
        self.string(column).map(EntityId::new)
    }

    pub fn opt_decimal(&self, column: &str) -> Result<Option<Decimal>, RepositoryError> {
        match self.raw(column) {
            None => Ok(None),
            Some(s) => Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map(Some)
                .map_err(|e| RepositoryError::Decode(format!("{column}={s}: {e}"))),
        }
    }

    /// NULL decodes as zero.
    pub fn decimal(&self, column: &str) -> Result<Decimal, RepositoryError> {
        Ok(self.opt_decimal(column)?.unwrap_or_default())
    }

    /// NULL decodes as zero. Float-typed sums are truncated.
    pub fn count(&self, column: &str) -> Result<u64, RepositoryError> {
        match self.raw(column) {
            None => Ok(0),
            Some(s) => s
                .parse::<u64>()
                .or_else(|_| s.parse::<f64>().map(|f| f.max(0.0) as u64))
                .map_err(|e| RepositoryError::Decode(format!("{column}={s}: {e}"))),
        }
    }
}

fn decode_rows(schema: &TableSchema, rows: Vec<WireRow>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            Row(schema
                .fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), cell.v))
                .collect())
        })
        .collect()
}

// =============================================================================
// Client
// =============================================================================

pub struct BigQueryClient {
    http: Client,
    auth: Arc<GcpAuth>,
    base_url: String,
    project_id: String,
    dataset_id: String,
    location: String,
}

impl BigQueryClient {
    pub fn new(
        auth: Arc<GcpAuth>,
        project_id: &str,
        dataset_id: &str,
        location: &str,
        timeout: Duration,
    ) -> Result<Self, RepositoryError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            auth,
            base_url: BIGQUERY_URL.to_string(),
            project_id: project_id.to_string(),
            dataset_id: dataset_id.to_string(),
            location: location.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fully qualified `project.dataset.table` for use inside SQL.
    pub fn table(&self, name: &str) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, name)
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    async fn bearer(&self) -> Result<String, RepositoryError> {
        self.auth
            .access_token()
            .await
            .map_err(|e| RepositoryError::Auth(e.to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, RepositoryError> {
        let token = self.bearer().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RepositoryError::Query(format!("HTTP {}: {}", status.as_u16(), text)));
        }
        serde_json::from_str(&text).map_err(|e| RepositoryError::Decode(e.to_string()))
    }

    /// Run a standard-SQL query and collect every result page.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, RepositoryError> {
        let url = format!("{}/projects/{}/queries", self.base_url, self.project_id);
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": params.iter().map(QueryParam::to_wire).collect::<Vec<_>>(),
            "location": self.location,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        debug!(params = params.len(), "BigQuery query");

        let value = self.send(self.http.post(&url).json(&body)).await?;
        let mut page: QueryResponse =
            serde_json::from_value(value).map_err(|e| RepositoryError::Decode(e.to_string()))?;

        let mut rows = Vec::new();
        let mut schema: Option<TableSchema> = None;
        let mut polls = 0;

        loop {
            if !page.errors.is_empty() {
                return Err(RepositoryError::Query(Value::Array(page.errors).to_string()));
            }

            let page_token = if page.job_complete {
                if let Some(s) = page.schema.take() {
                    schema = Some(s);
                }
                let fields = schema
                    .as_ref()
                    .ok_or_else(|| RepositoryError::Decode("result without schema".to_string()))?;
                rows.extend(decode_rows(fields, std::mem::take(&mut page.rows)));
                match page.page_token.take() {
                    Some(token) => Some(token),
                    None => break,
                }
            } else {
                polls += 1;
                if polls > MAX_INCOMPLETE_POLLS {
                    return Err(RepositoryError::Query("query did not complete in time".to_string()));
                }
                None
            };

            let job = page
                .job_reference
                .take()
                .ok_or_else(|| RepositoryError::Decode("missing jobReference".to_string()))?;
            let url = format!("{}/projects/{}/queries/{}", self.base_url, self.project_id, job.job_id);
            let location = job.location.unwrap_or_else(|| self.location.clone());
            let mut query: Vec<(&str, String)> = vec![
                ("location", location),
                ("timeoutMs", QUERY_TIMEOUT_MS.to_string()),
            ];
            if let Some(token) = page_token {
                query.push(("pageToken", token));
            }

            let value = self.send(self.http.get(&url).query(&query)).await?;
            let job_id = job.job_id;
            page = serde_json::from_value(value).map_err(|e| RepositoryError::Decode(e.to_string()))?;
            if page.job_reference.is_none() {
                page.job_reference = Some(JobReference { job_id, location: None });
            }
        }

        Ok(rows)
    }

    /// Stream rows into a table. `rows` pairs an insert id with the row JSON.
    pub async fn insert_all(&self, table: &str, rows: Vec<(String, Value)>) -> Result<(), RepositoryError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.base_url, self.project_id, self.dataset_id, table
        );
        let body = json!({
            "rows": rows
                .into_iter()
                .map(|(insert_id, row)| json!({ "insertId": insert_id, "json": row }))
                .collect::<Vec<_>>(),
        });

        let value = self.send(self.http.post(&url).json(&body)).await?;
        match value.get("insertErrors") {
            Some(Value::Array(errors)) if !errors.is_empty() => {
                Err(RepositoryError::Query(Value::Array(errors.clone()).to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Create `table` with `schema` unless it already exists.
    pub async fn ensure_table(&self, table: &str, schema: Value) -> Result<(), RepositoryError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.base_url, self.project_id, self.dataset_id
        );
        let body = json!({
            "tableReference": {
                "projectId": self.project_id,
                "datasetId": self.dataset_id,
                "tableId": table,
            },
            "schema": { "fields": schema },
        });

        match self.send(self.http.post(&url).json(&body)).await {
            Ok(_) => {
                info!(table, "Created table");
                Ok(())
            }
            Err(RepositoryError::Query(msg)) if msg.starts_with("HTTP 409") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Warehouse-backed [`MetricsRepository`].
///
/// Performance windows end `attribution_lag_days` before today so that
/// late-attributed conversions do not read as zero-order days.
pub struct BigQueryRepository {
    client: Arc<BigQueryClient>,
    timezone: String,
    attribution_lag_days: u32,
}

impl BigQueryRepository {
    pub fn new(client: Arc<BigQueryClient>, timezone: &str, attribution_lag_days: u32) -> Self {
        Self {
            client,
            timezone: timezone.to_string(),
            attribution_lag_days,
        }
    }

    fn window_params(&self, lookback_days: u32) -> Vec<QueryParam> {
        vec![
            QueryParam::Int("lookback_days", i64::from(lookback_days)),
            QueryParam::Int("lag_days", i64::from(self.attribution_lag_days)),
            QueryParam::Str("tz", self.timezone.clone()),
        ]
    }

    fn window_predicate(column: &str) -> String {
        format!(
            "{column} BETWEEN DATE_SUB(CURRENT_DATE(@tz), INTERVAL @lookback_days + @lag_days DAY) \
             AND DATE_SUB(CURRENT_DATE(@tz), INTERVAL @lag_days DAY)"
        )
    }
}

#[async_trait]
impl MetricsRepository for BigQueryRepository {
    async fn asin_aov(
        &self,
        window_days: u32,
        min_orders: u64,
    ) -> Result<HashMap<String, AsinAov>, RepositoryError> {
        let sql = format!(
            "SELECT
               advertisedAsin AS asin,
               SAFE_DIVIDE(SUM(sales), NULLIF(SUM(purchases), 0)) AS aov,
               SUM(purchases) AS orders,
               COUNT(DISTINCT segments_date) AS active_days
             FROM {products}
             WHERE {window} AND sales > 0
             GROUP BY asin
             HAVING orders >= @min_orders AND aov > 10",
            products = self.client.table("sp_advertised_product_metrics"),
            window = Self::window_predicate("segments_date"),
        );
        let mut params = self.window_params(window_days);
        params.push(QueryParam::Int("min_orders", min_orders as i64));

        let rows = self.client.query(&sql, &params).await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(aov) = row.opt_decimal("aov")? else {
                continue;
            };
            let asin = row.string("asin")?;
            let orders = row.count("orders")?;
            let active_days = row.count("active_days")?;
            map.insert(
                asin.clone(),
                AsinAov {
                    asin,
                    aov,
                    orders,
                    confidence: AsinAov::confidence_for(orders, active_days),
                    source: format!("{window_days}d"),
                },
            );
        }
        info!(window_days, asins = map.len(), "Loaded ASIN AOV");
        Ok(map)
    }

    async fn keywords_for_optimization(
        &self,
        lookback_days: u32,
        min_clicks: u64,
    ) -> Result<Vec<KeywordPerformance>, RepositoryError> {
        let sql = format!(
            "WITH keyword_metrics AS (
               SELECT
                 k.keywordId, k.adGroupId, k.campaignId, k.keywordText, k.matchType,
                 k.bid AS current_bid,
                 COALESCE(SUM(m.clicks), 0) AS clicks,
                 COALESCE(SUM(m.cost), 0) AS spend,
                 COALESCE(SUM(m.purchases), 0) AS conversions,
                 COALESCE(SUM(m.sales), 0) AS sales,
                 SAFE_DIVIDE(SUM(m.purchases), NULLIF(SUM(m.clicks), 0)) AS cvr,
                 SAFE_DIVIDE(SUM(m.cost), NULLIF(SUM(m.sales), 0)) AS acos
               FROM {keywords} k
               LEFT JOIN {targeting} m
                 ON k.keywordId = m.targetId AND {window_m}
               WHERE k.state = 'ENABLED'
               GROUP BY 1, 2, 3, 4, 5, 6
             ),
             keyword_asins AS (
               SELECT t.targetId AS keywordId, ANY_VALUE(a.advertisedAsin) AS asin
               FROM {targeting} t
               INNER JOIN {products} a
                 ON t.campaignId = a.campaignId AND t.segments_date = a.segments_date
               WHERE {window_t}
               GROUP BY 1
             )
             SELECT km.*, ka.asin
             FROM keyword_metrics km
             LEFT JOIN keyword_asins ka ON km.keywordId = ka.keywordId
             WHERE km.clicks >= @min_clicks OR km.conversions > 0
             ORDER BY km.spend DESC",
            keywords = self.client.table("sp_keywords"),
            targeting = self.client.table("sp_targeting_metrics"),
            products = self.client.table("sp_advertised_product_metrics"),
            window_m = Self::window_predicate("m.segments_date"),
            window_t = Self::window_predicate("t.segments_date"),
        );
        let mut params = self.window_params(lookback_days);
        params.push(QueryParam::Int("min_clicks", min_clicks as i64));

        let rows = self.client.query(&sql, &params).await?;
        let keywords = rows
            .iter()
            .map(|row| {
                Ok(KeywordPerformance {
                    keyword_id: row.entity("keywordId")?,
                    campaign_id: row.entity("campaignId")?,
                    ad_group_id: row.entity("adGroupId")?,
                    keyword_text: row.string("keywordText")?,
                    match_type: row.opt_string("matchType").unwrap_or_default(),
                    current_bid: row.decimal("current_bid")?,
                    clicks: row.count("clicks")?,
                    conversions: row.count("conversions")?,
                    spend: row.decimal("spend")?,
                    sales: row.decimal("sales")?,
                    cvr: row.opt_decimal("cvr")?,
                    acos: row.opt_decimal("acos")?,
                    asin: row.opt_string("asin"),
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;
        info!(keywords = keywords.len(), "Loaded keywords for optimization");
        Ok(keywords)
    }

    async fn campaign_budget_status(&self) -> Result<Vec<CampaignBudgetStatus>, RepositoryError> {
        let sql = format!(
            "SELECT
               c.campaignId, c.name AS campaign_name, c.budget, c.budgetType,
               COALESCE(SUM(m.cost), 0) AS spend_today
             FROM {campaigns} c
             LEFT JOIN {metrics} m
               ON c.campaignId = m.campaignId AND m.segments_date = CURRENT_DATE(@tz)
             WHERE c.state = 'ENABLED' AND c.budgetType = 'DAILY'
             GROUP BY 1, 2, 3, 4",
            campaigns = self.client.table("sp_campaigns"),
            metrics = self.client.table("sp_campaign_metrics"),
        );
        let params = [QueryParam::Str("tz", self.timezone.clone())];

        let rows = self.client.query(&sql, &params).await?;
        let campaigns = rows
            .iter()
            .map(|row| {
                Ok(CampaignBudgetStatus {
                    campaign_id: row.entity("campaignId")?,
                    campaign_name: row.opt_string("campaign_name").unwrap_or_default(),
                    budget: row.decimal("budget")?,
                    budget_type: row.opt_string("budgetType").unwrap_or_default(),
                    spend_today: row.decimal("spend_today")?,
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;
        info!(campaigns = campaigns.len(), "Loaded campaign budget status");
        Ok(campaigns)
    }

    async fn campaign_keyword_bids(
        &self,
        campaign_id: &EntityId,
        above_bid: Decimal,
    ) -> Result<Vec<KeywordBid>, RepositoryError> {
        let sql = format!(
            "SELECT keywordId, keywordText, bid AS current_bid
             FROM {keywords}
             WHERE CAST(campaignId AS STRING) = @campaign_id
               AND state = 'ENABLED'
               AND bid > @above_bid",
            keywords = self.client.table("sp_keywords"),
        );
        let params = [
            QueryParam::Str("campaign_id", campaign_id.to_string()),
            QueryParam::Numeric("above_bid", above_bid),
        ];

        let rows = self.client.query(&sql, &params).await?;
        rows.iter()
            .map(|row| {
                Ok(KeywordBid {
                    keyword_id: row.entity("keywordId")?,
                    keyword_text: row.opt_string("keywordText").unwrap_or_default(),
                    current_bid: row.decimal("current_bid")?,
                })
            })
            .collect()
    }

    async fn search_term_candidates(
        &self,
        lookback_days: u32,
        min_clicks: u64,
    ) -> Result<Vec<SearchTermCandidate>, RepositoryError> {
        let sql = format!(
            "WITH terms AS (
               SELECT
                 LOWER(TRIM(s.searchTerm)) AS search_term,
                 s.campaignId, s.adGroupId, s.keywordId,
                 SUM(s.clicks) AS clicks,
                 SUM(s.purchases) AS orders,
                 SUM(s.cost) AS spend,
                 SUM(s.sales) AS sales
               FROM {search_terms} s
               WHERE {window}
               GROUP BY 1, 2, 3, 4
             ),
             ad_group_asins AS (
               SELECT adGroupId, ANY_VALUE(advertisedAsin) AS asin
               FROM {products}
               WHERE {window_a}
               GROUP BY 1
             )
             SELECT
               t.*,
               SAFE_DIVIDE(t.spend, NULLIF(t.sales, 0)) AS acos,
               SAFE_DIVIDE(t.orders, NULLIF(t.clicks, 0)) AS cvr,
               a.asin
             FROM terms t
             LEFT JOIN ad_group_asins a ON t.adGroupId = a.adGroupId
             LEFT JOIN {keywords} k
               ON LOWER(k.keywordText) = t.search_term
               AND k.adGroupId = t.adGroupId
               AND k.state != 'ARCHIVED'
             WHERE k.keywordId IS NULL AND t.clicks >= @min_clicks
             ORDER BY t.clicks DESC",
            search_terms = self.client.table("sp_search_term_metrics"),
            products = self.client.table("sp_advertised_product_metrics"),
            keywords = self.client.table("sp_keywords"),
            window = Self::window_predicate("s.segments_date"),
            window_a = Self::window_predicate("segments_date"),
        );
        let mut params = self.window_params(lookback_days);
        params.push(QueryParam::Int("min_clicks", min_clicks as i64));

        let rows = self.client.query(&sql, &params).await?;
        let terms = rows
            .iter()
            .map(|row| {
                Ok(SearchTermCandidate {
                    search_term: row.string("search_term")?,
                    campaign_id: row.entity("campaignId")?,
                    ad_group_id: row.entity("adGroupId")?,
                    source_keyword_id: row.entity("keywordId")?,
                    clicks: row.count("clicks")?,
                    orders: row.count("orders")?,
                    spend: row.decimal("spend")?,
                    sales: row.decimal("sales")?,
                    acos: row.opt_decimal("acos")?,
                    cvr: row.opt_decimal("cvr")?,
                    asin: row.opt_string("asin"),
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;
        if terms.is_empty() {
            warn!(lookback_days, "No unmanaged search terms found");
        } else {
            info!(terms = terms.len(), "Loaded search term candidates");
        }
        Ok(terms)
    }
}
