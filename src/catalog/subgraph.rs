// GraphQL subgraph client for pool discovery.

use async_trait::async_trait;
use ethers::types::Address;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

use super::indexer::{BlockTag, PoolRecord, IndexerError, PoolIndexer};

/// Entity and field names of one subgraph flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphSchema {
    /// `pairs` on V2-style subgraphs, `pools` on V3/Algebra ones.
    pub entity: String,
    /// USD liquidity field, also the sort key.
    pub tvl_field: String,
    /// Algebra-style subgraphs expose the pool deployer.
    pub with_deployer: bool,
}

impl Default for SubgraphSchema {
    fn default() -> Self {
        Self {
            entity: "pairs".to_string(),
            tvl_field: "reserveUSD".to_string(),
            with_deployer: false,
        }
    }
}

impl SubgraphSchema {
    pub fn algebra() -> Self {
        Self {
            entity: "pools".to_string(),
            tvl_field: "totalValueLockedUSD".to_string(),
            with_deployer: true,
        }
    }
}

/// [`PoolIndexer`] over a Graph-protocol subgraph, paging its pool entity by
/// descending USD liquidity.
#[derive(Debug, Clone)]
pub struct SubgraphIndexer {
    client: Client,
    url: Url,
    schema: SubgraphSchema,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<PoolsData>,
    #[serde(default)]
    errors: Vec<GraphError>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PoolsData {
    pools: Vec<SubgraphPool>,
}

#[derive(Debug, Deserialize)]
struct TokenRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubgraphPool {
    id: String,
    token0: TokenRef,
    token1: TokenRef,
    #[serde(default)]
    deployer: Option<String>,
    /// Aliased from the schema's TVL field.
    #[serde(default)]
    tvl: Option<String>,
}

impl SubgraphIndexer {
    pub fn new(url: Url, schema: SubgraphSchema, timeout: Duration) -> Result<Self, IndexerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url,
            schema,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn schema(&self) -> &SubgraphSchema {
        &self.schema
    }
}

/// The entity is aliased to `pools` and its TVL field to `tvl`, so every
/// schema parses into the same response shape.
pub(crate) fn pools_query(block: BlockTag, schema: &SubgraphSchema) -> String {
    let block_filter = match block {
        BlockTag::Number(number) => format!("block: {{ number: {} }}", number),
        BlockTag::Latest => String::new(),
    };
    format!(
        "query ($skip: Int!, $first: Int!) {{
  pools: {entity}(
    {block_filter}
    orderBy: {tvl_field}
    orderDirection: desc
    skip: $skip
    first: $first
  ) {{
    id{deployer}
    tvl: {tvl_field}
    token0 {{ id }}
    token1 {{ id }}
  }}
}}",
        entity = schema.entity,
        tvl_field = schema.tvl_field,
        block_filter = block_filter,
        deployer = if schema.with_deployer { "\n    deployer" } else { "" }
    )
}

fn parse_address(field: &str, raw: &str) -> Result<Address, IndexerError> {
    raw.parse::<Address>()
        .map_err(|e| IndexerError::Malformed(format!("{} {:?}: {}", field, raw, e)))
}

fn into_indexed_pool(pool: SubgraphPool) -> Result<PoolRecord, IndexerError> {
    Ok(PoolRecord {
        address: parse_address("pool id", &pool.id)?,
        token0: parse_address("token0", &pool.token0.id)?,
        token1: parse_address("token1", &pool.token1.id)?,
        deployer: pool
            .deployer
            .as_deref()
            .map(|raw| parse_address("deployer", raw))
            .transpose()?,
        fee: None,
        tvl_usd: pool
            .tvl
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|tvl| tvl.is_finite())
            .unwrap_or(0.0),
    })
}

fn parse_response(body: &str) -> Result<Vec<PoolRecord>, IndexerError> {
    let response: GraphResponse =
        serde_json::from_str(body).map_err(|e| IndexerError::Malformed(e.to_string()))?;
    if let Some(first) = response.errors.first() {
        return Err(IndexerError::from_query_message(&first.message));
    }
    let data = response
        .data
        .ok_or_else(|| IndexerError::Malformed("response has neither data nor errors".to_string()))?;
    data.pools.into_iter().map(into_indexed_pool).collect()
}

#[async_trait]
impl PoolIndexer for SubgraphIndexer {
    async fn query_pools(&self, skip: usize, limit: usize, block: BlockTag) -> Result<Vec<PoolRecord>, IndexerError> {
        let body = json!({
            "query": pools_query(block, &self.schema),
            "variables": { "skip": skip, "first": limit },
        });
        debug!("Subgraph query skip={} first={} block={:?}", skip, limit, block);

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IndexerError::Timeout
                } else {
                    IndexerError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status(status.as_u16()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        parse_response(&text)
    }
}
