/// Etherscan-compatible adapter
///
/// Request: `module=account&action=tokentx` with contract, block window, page,
/// offset and sort. Response envelope `{status, message, result}`.
use ethers::types::Address;
use serde::Deserialize;

use super::{classify_status, FetchedPage, PageOutcome, PageRequest};
use crate::error::FetchError;
use crate::etl::transform::parse_quantity;
use crate::keys::ApiKey;
use crate::models::{parse_amount, Chain, TransferEvent};

/// Etherscan's own "up to head" sentinel
const OPEN_END_BLOCK: u64 = 999_999_999;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: serde_json::Value,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenTx {
    block_number: String,
    time_stamp: String,
    hash: String,
    from: String,
    to: String,
    value: String,
    #[serde(default)]
    log_index: Option<String>,
    #[serde(default)]
    method_id: Option<String>,
}

/// Query parameters for one page
pub fn build_query(chain: &Chain, request: &PageRequest, key: &ApiKey) -> Vec<(&'static str, String)> {
    vec![
        ("chainid", chain.id.to_string()),
        ("module", "account".to_string()),
        ("action", "tokentx".to_string()),
        ("contractaddress", chain.contract_address.clone()),
        ("startblock", request.start_block.to_string()),
        ("endblock", request.end_block.unwrap_or(OPEN_END_BLOCK).to_string()),
        ("page", request.page.to_string()),
        ("offset", request.page_size.to_string()),
        ("sort", request.sort.as_str().to_string()),
        ("apikey", key.secret.clone()),
    ]
}

pub async fn fetch(
    http: &reqwest::Client,
    chain: &Chain,
    request: &PageRequest,
    key: &ApiKey,
) -> Result<PageOutcome, FetchError> {
    let response = http.get(&chain.base_url).query(&build_query(chain, request, key)).send().await?;

    if let Some(outcome) = classify_status(response.status()) {
        return Ok(outcome);
    }

    let body = response.text().await?;
    Ok(decode_envelope(chain, &body))
}

/// Classify a raw response body
pub fn decode_envelope(chain: &Chain, body: &str) -> PageOutcome {
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return PageOutcome::HardError { code: "malformed_response".to_string(), message: e.to_string() };
        }
    };

    let status = match &envelope.status {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    let message = envelope.message.to_lowercase();
    let result_text = envelope.result.as_str().unwrap_or_default().to_lowercase();

    if status == "1" {
        return match envelope.result {
            serde_json::Value::Array(items) if items.is_empty() => PageOutcome::Empty,
            serde_json::Value::Array(items) => match decode_rows(chain, items) {
                Ok(page) => PageOutcome::Rows(page),
                Err(message) => PageOutcome::HardError { code: "malformed_row".to_string(), message },
            },
            _ => PageOutcome::HardError {
                code: "malformed_response".to_string(),
                message: "status 1 without a result array".to_string(),
            },
        };
    }

    if message.contains("no transactions found") || message.contains("no records found") {
        return PageOutcome::Empty;
    }

    if result_text.contains("rate limit") || result_text.contains("max calls") || message.contains("rate limit") {
        return PageOutcome::RateLimited(envelope.result.as_str().unwrap_or(&envelope.message).to_string());
    }

    PageOutcome::HardError {
        code: if envelope.message.is_empty() { "unknown".to_string() } else { envelope.message.clone() },
        message: envelope.result.as_str().map(str::to_string).unwrap_or_else(|| envelope.result.to_string()),
    }
}

/// Decode rows; a row with an unusable amount or address is skipped but still counted
fn decode_rows(chain: &Chain, items: Vec<serde_json::Value>) -> Result<FetchedPage, String> {
    let received = items.len();
    let mut events: Vec<TransferEvent> = Vec::with_capacity(received);

    for item in items {
        let tx: TokenTx = serde_json::from_value(item.clone()).map_err(|e| e.to_string())?;

        let block_number = parse_quantity(&tx.block_number).ok_or(format!("bad blockNumber {}", tx.block_number))?;
        let seconds = parse_quantity(&tx.time_stamp).ok_or(format!("bad timeStamp {}", tx.time_stamp))?;
        let timestamp = chrono::DateTime::from_timestamp(seconds as i64, 0).ok_or("timestamp out of range")?;
        let tx_hash = tx.hash.to_lowercase();

        let (from, to, value) = match (tx.from.parse::<Address>(), tx.to.parse::<Address>(), parse_amount(&tx.value)) {
            (Ok(from), Ok(to), Some(value)) => (from, to, value),
            _ => {
                tracing::warn!(
                    chain = %chain.name,
                    block = block_number,
                    tx = %tx_hash,
                    value = %tx.value,
                    "Skipping transfer with an invalid amount or address"
                );
                continue;
            }
        };

        // Older deployments omit logIndex; fall back to the ordinal within the tx
        let log_index = match tx.log_index.as_deref().and_then(parse_quantity) {
            Some(index) => index,
            None => events.iter().filter(|e| e.tx_hash == tx_hash).count() as u64,
        };

        events.push(TransferEvent {
            chain_id: chain.id,
            block_number,
            tx_hash,
            log_index,
            timestamp,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
            value_raw: value.to_string(),
            method_id: tx.method_id.filter(|m| !m.is_empty()),
            raw_payload: item,
        });
    }

    Ok(FetchedPage { received, events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use crate::rpc::SortOrder;

    const A: &str = "0xAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaa";
    const B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const C: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

    fn chain() -> Chain {
        Chain {
            id: 137,
            name: "polygon".into(),
            provider: "etherscan".into(),
            kind: ProviderKind::EtherscanPro,
            base_url: "https://api.etherscan.io/v2/api".into(),
            contract_address: "0xToken".into(),
            decimals: 18,
        }
    }

    #[test]
    fn test_decode_rows() {
        let body = format!(
            r#"{{"status":"1","message":"OK","result":[
            {{"blockNumber":"100","timeStamp":"1700000000","hash":"0xAB","from":"{A}","to":"{B}",
             "value":"1000","logIndex":"3","methodId":"0xa9059cbb"}},
            {{"blockNumber":"101","timeStamp":"1700000012","hash":"0xCD","from":"{B}","to":"{C}",
             "value":"5","methodId":""}}
        ]}}"#
        );

        let PageOutcome::Rows(page) = decode_envelope(&chain(), &body) else {
            panic!("expected rows");
        };
        let rows = page.events;
        assert_eq!(page.received, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].block_number, 100);
        assert_eq!(rows[0].tx_hash, "0xab");
        assert_eq!(rows[0].log_index, 3);
        assert_eq!(rows[0].from, A.to_lowercase());
        assert_eq!(rows[0].value_raw, "1000");
        assert_eq!(rows[0].method_id.as_deref(), Some("0xa9059cbb"));
        assert_eq!(rows[1].log_index, 0);
        assert_eq!(rows[1].method_id, None);
        assert_eq!(rows[1].chain_id, 137);
    }

    #[test]
    fn test_rows_with_bad_amounts_are_skipped_but_counted() {
        let body = format!(
            r#"{{"status":"1","message":"OK","result":[
            {{"blockNumber":"7","timeStamp":"1700000000","hash":"0x01","from":"{A}","to":"{B}","value":""}},
            {{"blockNumber":"7","timeStamp":"1700000000","hash":"0x02","from":"{A}","to":"{B}","value":"12abc"}},
            {{"blockNumber":"7","timeStamp":"1700000000","hash":"0x03","from":"0xAAA","to":"{B}","value":"9"}},
            {{"blockNumber":"8","timeStamp":"1700000012","hash":"0x04","from":"{A}","to":"{B}","value":"0042"}}
        ]}}"#
        );

        let PageOutcome::Rows(page) = decode_envelope(&chain(), &body) else {
            panic!("expected rows");
        };
        assert_eq!(page.received, 4);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].tx_hash, "0x04");
        assert_eq!(page.events[0].value_raw, "42");
    }

    #[test]
    fn test_no_records_is_terminal_empty() {
        let body = r#"{"status":"0","message":"No transactions found","result":[]}"#;
        assert_eq!(decode_envelope(&chain(), body), PageOutcome::Empty);

        let body = r#"{"status":"0","message":"No records found","result":[]}"#;
        assert_eq!(decode_envelope(&chain(), body), PageOutcome::Empty);

        let body = r#"{"status":"1","message":"OK","result":[]}"#;
        assert_eq!(decode_envelope(&chain(), body), PageOutcome::Empty);
    }

    #[test]
    fn test_rate_limit_classification() {
        let body = r#"{"status":"0","message":"NOTOK","result":"Max calls per sec rate limit reached (5/sec)"}"#;
        assert!(matches!(decode_envelope(&chain(), body), PageOutcome::RateLimited(_)));
    }

    #[test]
    fn test_hard_error_classification() {
        let body = r#"{"status":"0","message":"NOTOK","result":"Error! Invalid contract address format"}"#;
        assert_eq!(
            decode_envelope(&chain(), body),
            PageOutcome::HardError {
                code: "NOTOK".into(),
                message: "Error! Invalid contract address format".into()
            }
        );

        assert!(matches!(
            decode_envelope(&chain(), "<html>bad gateway</html>"),
            PageOutcome::HardError { ref code, .. } if code == "malformed_response"
        ));
    }

    #[test]
    fn test_build_query() {
        let key = ApiKey { provider: "etherscan".into(), secret: "SECRET".into() };
        let request = PageRequest { page: 2, page_size: 500, sort: SortOrder::Asc, start_block: 42, end_block: None };
        let query = build_query(&chain(), &request, &key);

        let get = |name: &str| query.iter().find(|(k, _)| *k == name).map(|(_, v)| v.clone());
        assert_eq!(get("chainid").as_deref(), Some("137"));
        assert_eq!(get("startblock").as_deref(), Some("42"));
        assert_eq!(get("endblock").as_deref(), Some("999999999"));
        assert_eq!(get("offset").as_deref(), Some("500"));
        assert_eq!(get("sort").as_deref(), Some("asc"));
        assert_eq!(get("apikey").as_deref(), Some("SECRET"));
    }
}
