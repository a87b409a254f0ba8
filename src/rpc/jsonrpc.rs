/// JSON-RPC `eth_getLogs` adapter
///
/// Nodes answer a whole block window at once, so only page 1 carries rows and
/// callers keep windows within `ProviderKind::max_block_range`. `base_url` may
/// contain an `{apikey}` placeholder which is substituted with the rotated
/// credential. Logs must carry `blockTimestamp`.
use ethers::types::{Address, BlockNumber, Filter, Log, H256, U256, U64};
use ethers::utils::keccak256;
use serde::Deserialize;
use serde_json::json;

use super::{classify_status, FetchedPage, PageOutcome, PageRequest, SortOrder};
use crate::error::FetchError;
use crate::keys::ApiKey;
use crate::models::{Chain, TransferEvent};

pub const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Topic 0 of every ERC20 `Transfer` log
pub fn transfer_topic() -> H256 {
    H256::from(keccak256(TRANSFER_EVENT.as_bytes()))
}

pub fn endpoint(chain: &Chain, key: &ApiKey) -> String {
    chain.base_url.replace("{apikey}", &key.secret)
}

/// Log filter for the token's transfers inside the requested window
pub fn build_filter(chain: &Chain, request: &PageRequest) -> Result<Filter, String> {
    let address: Address =
        chain.contract_address.parse().map_err(|_| format!("invalid contract address {}", chain.contract_address))?;
    let to_block = match request.end_block {
        Some(block) => BlockNumber::Number(U64::from(block)),
        None => BlockNumber::Latest,
    };

    Ok(Filter::new()
        .address(address)
        .from_block(BlockNumber::Number(U64::from(request.start_block)))
        .to_block(to_block)
        .event(TRANSFER_EVENT))
}

fn rpc_body(method: &str, params: serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params })
}

pub async fn fetch(
    http: &reqwest::Client,
    chain: &Chain,
    request: &PageRequest,
    key: &ApiKey,
) -> Result<PageOutcome, FetchError> {
    if request.page > 1 {
        return Ok(PageOutcome::Empty);
    }

    let filter = match build_filter(chain, request) {
        Ok(filter) => filter,
        Err(message) => return Ok(PageOutcome::HardError { code: "invalid_contract".to_string(), message }),
    };
    let body = rpc_body("eth_getLogs", json!([filter]));
    let response = http.post(endpoint(chain, key)).json(&body).send().await?;

    if let Some(outcome) = classify_status(response.status()) {
        return Ok(outcome);
    }

    let body = response.text().await?;
    Ok(decode_response(chain, request, &body))
}

/// `eth_blockNumber` for the chain head
pub async fn fetch_head(http: &reqwest::Client, chain: &Chain, key: &ApiKey) -> Result<PageOutcome<u64>, FetchError> {
    let body = rpc_body("eth_blockNumber", json!([]));
    let response = http.post(endpoint(chain, key)).json(&body).send().await?;

    if let Some(outcome) = classify_status(response.status()) {
        return Ok(outcome);
    }

    let body = response.text().await?;
    Ok(decode_head(&body))
}

fn parse_response<T>(body: &str) -> Result<serde_json::Value, PageOutcome<T>> {
    let response: RpcResponse = serde_json::from_str(body)
        .map_err(|e| PageOutcome::HardError { code: "malformed_response".to_string(), message: e.to_string() })?;

    if let Some(error) = response.error {
        let lowered = error.message.to_lowercase();
        if error.code == 429 || lowered.contains("rate") || lowered.contains("too many requests") {
            return Err(PageOutcome::RateLimited(error.message));
        }
        return Err(PageOutcome::HardError { code: error.code.to_string(), message: error.message });
    }

    response.result.ok_or_else(|| PageOutcome::HardError {
        code: "malformed_response".to_string(),
        message: "missing result".to_string(),
    })
}

pub fn decode_head(body: &str) -> PageOutcome<u64> {
    let result = match parse_response(body) {
        Ok(result) => result,
        Err(outcome) => return outcome,
    };
    match serde_json::from_value::<U64>(result) {
        Ok(head) => PageOutcome::Rows(head.as_u64()),
        Err(e) => PageOutcome::HardError { code: "malformed_response".to_string(), message: e.to_string() },
    }
}

pub fn decode_response(chain: &Chain, request: &PageRequest, body: &str) -> PageOutcome {
    let items = match parse_response(body) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(_) => {
            return PageOutcome::HardError {
                code: "malformed_response".to_string(),
                message: "result is not an array".to_string(),
            };
        }
        Err(outcome) => return outcome,
    };

    let received = items.len();
    let topic = transfer_topic();
    let mut events = Vec::with_capacity(received);
    for item in items {
        match decode_log(chain, &topic, item) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(message) => return PageOutcome::HardError { code: "malformed_log".to_string(), message },
        }
    }

    if received == 0 {
        return PageOutcome::Empty;
    }
    if request.sort == SortOrder::Desc {
        events.reverse();
    }
    PageOutcome::Rows(FetchedPage { received, events })
}

fn decode_log(chain: &Chain, topic: &H256, item: serde_json::Value) -> Result<Option<TransferEvent>, String> {
    let log: Log = serde_json::from_value(item.clone()).map_err(|e| e.to_string())?;

    // Reorged-out logs and non-standard Transfer shapes (e.g. ERC721) are not ERC20 transfers
    if log.removed == Some(true) || log.topics.len() != 3 || log.topics[0] != *topic || log.data.len() > 32 {
        return Ok(None);
    }

    let block_number = log.block_number.ok_or("log without blockNumber")?.as_u64();
    let tx_hash = log.transaction_hash.ok_or("log without transactionHash")?;
    let log_index = log.log_index.ok_or("log without logIndex")?.low_u64();
    let seconds = item
        .get("blockTimestamp")
        .and_then(|value| serde_json::from_value::<U64>(value.clone()).ok())
        .ok_or_else(|| format!("log {:?}:{} has no blockTimestamp", tx_hash, log_index))?;
    let timestamp = chrono::DateTime::from_timestamp(seconds.as_u64() as i64, 0).ok_or("timestamp out of range")?;

    let from = Address::from_slice(&log.topics[1].as_bytes()[12..]);
    let to = Address::from_slice(&log.topics[2].as_bytes()[12..]);
    let value = U256::from_big_endian(&log.data);

    Ok(Some(TransferEvent {
        chain_id: chain.id,
        block_number,
        tx_hash: format!("{:?}", tx_hash),
        log_index,
        timestamp,
        from: format!("{:?}", from),
        to: format!("{:?}", to),
        value_raw: value.to_string(),
        method_id: None,
        raw_payload: item,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    const TX: &str = "0x00000000000000000000000000000000000000000000000000000000000feed0";

    fn chain() -> Chain {
        Chain {
            id: 8453,
            name: "base".into(),
            provider: "alchemy".into(),
            kind: ProviderKind::JsonRpc,
            base_url: "https://base-mainnet.example.com/v2/{apikey}".into(),
            contract_address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".into(),
            decimals: 6,
        }
    }

    fn log(block: &str, index: &str) -> String {
        format!(
            r#"{{"address":"0x833589fcd6edb6e08f4c7c32d4f71b54bda02913",
            "blockNumber":"{block}","transactionHash":"{TX}","logIndex":"{index}",
            "topics":["{:?}",
                "0x000000000000000000000000aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "0x000000000000000000000000bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"],
            "data":"0x00000000000000000000000000000000000000000000000000000000000f4240",
            "blockTimestamp":"0x6553f100","removed":false}}"#,
            transfer_topic()
        )
    }

    #[test]
    fn test_transfer_topic() {
        assert_eq!(
            format!("{:?}", transfer_topic()),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_decode_logs() {
        let body = format!(r#"{{"jsonrpc":"2.0","id":1,"result":[{},{}]}}"#, log("0x10", "0x0"), log("0x11", "0x2"));
        let request = PageRequest::ascending(16, None, 100);

        let PageOutcome::Rows(page) = decode_response(&chain(), &request, &body) else {
            panic!("expected rows");
        };
        let rows = page.events;
        assert_eq!(page.received, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].block_number, 16);
        assert_eq!(rows[1].log_index, 2);
        assert_eq!(rows[0].from, "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(rows[0].to, "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        assert_eq!(rows[0].value_raw, "1000000");
        assert_eq!(rows[0].timestamp.timestamp(), 0x6553f100);
        assert_eq!(rows[0].tx_hash, TX);
    }

    #[test]
    fn test_non_transfer_logs_are_counted_but_skipped() {
        let approval = log("0x12", "0x1").replace(
            &format!("{:?}", transfer_topic()),
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925",
        );
        let body = format!(r#"{{"result":[{},{}]}}"#, log("0x10", "0x0"), approval);

        let PageOutcome::Rows(page) = decode_response(&chain(), &PageRequest::ascending(0, Some(20), 100), &body)
        else {
            panic!("expected rows");
        };
        assert_eq!(page.received, 2);
        assert_eq!(page.events.len(), 1);
    }

    #[test]
    fn test_descending_sort_reverses() {
        let body = format!(r#"{{"result":[{},{}]}}"#, log("0x10", "0x0"), log("0x11", "0x0"));
        let mut request = PageRequest::ascending(0, None, 100);
        request.sort = SortOrder::Desc;

        let PageOutcome::Rows(page) = decode_response(&chain(), &request, &body) else {
            panic!("expected rows");
        };
        assert_eq!(page.events[0].block_number, 17);
    }

    #[test]
    fn test_error_classification() {
        let request = PageRequest::ascending(0, None, 100);
        let limited = r#"{"error":{"code":429,"message":"Your app has exceeded its compute units per second"}}"#;
        assert!(matches!(decode_response(&chain(), &request, limited), PageOutcome::RateLimited(_)));

        let hard = r#"{"error":{"code":-32602,"message":"invalid block range params"}}"#;
        assert_eq!(
            decode_response(&chain(), &request, hard),
            PageOutcome::HardError { code: "-32602".into(), message: "invalid block range params".into() }
        );

        assert_eq!(decode_response(&chain(), &request, r#"{"result":[]}"#), PageOutcome::Empty);
    }

    #[test]
    fn test_missing_timestamp_is_hard_error() {
        let body = format!(r#"{{"result":[{}]}}"#, log("0x10", "0x0").replace(r#""blockTimestamp":"0x6553f100","#, ""));
        let request = PageRequest::ascending(0, None, 100);
        assert!(matches!(
            decode_response(&chain(), &request, &body),
            PageOutcome::HardError { ref code, .. } if code == "malformed_log"
        ));
    }

    #[test]
    fn test_decode_head() {
        assert_eq!(decode_head(r#"{"jsonrpc":"2.0","id":1,"result":"0x1b4"}"#), PageOutcome::Rows(436));
        assert!(matches!(decode_head(r#"{"error":{"code":429,"message":"rate"}}"#), PageOutcome::RateLimited(_)));
        assert!(matches!(decode_head(r#"{"result":null}"#), PageOutcome::HardError { .. }));
    }

    #[test]
    fn test_endpoint_and_filter() {
        let key = ApiKey { provider: "alchemy".into(), secret: "k-123".into() };
        assert_eq!(endpoint(&chain(), &key), "https://base-mainnet.example.com/v2/k-123");

        let filter = build_filter(&chain(), &PageRequest::ascending(255, Some(4096), 10)).unwrap();
        let body = rpc_body("eth_getLogs", json!([filter]));
        assert_eq!(body["method"], "eth_getLogs");
        assert_eq!(body["params"][0]["fromBlock"], "0xff");
        assert_eq!(body["params"][0]["toBlock"], "0x1000");
        assert_eq!(body["params"][0]["topics"][0], format!("{:?}", transfer_topic()));

        let open = build_filter(&chain(), &PageRequest::ascending(0, None, 10)).unwrap();
        assert_eq!(json!(open)["toBlock"], "latest");

        let mut bad = chain();
        bad.contract_address = "0xtoken".into();
        assert!(build_filter(&bad, &PageRequest::ascending(0, None, 10)).is_err());
    }
}
