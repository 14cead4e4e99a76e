//! JSON-RPC 2.0 front door over the task engine.
//!
//! Transport-agnostic: callers hand in one request value (or one raw line)
//! and get one response value back.

use fira_engine::{EngineError, TaskEngine};
use fira_models::TaskId;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TASK_NOT_FOUND: i64 = -32001;

/// Longest first word still treated as a ticker in free text.
const MAX_TICKER_LEN: usize = 5;

const COMMAND_WORD: &str = "research";

#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<EngineError> for RpcError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::TaskNotFound(_) => Self::new(TASK_NOT_FOUND, error.to_string()),
            EngineError::Config(_) => Self::new(INTERNAL_ERROR, error.to_string()),
        }
    }
}

/// A research request pulled out of `message/send` params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchRequest {
    pub ticker: String,
    pub company_name: String,
}

/// Accepts either explicit `ticker`/`company_name` params or a message
/// whose first text part reads like "Research AAPL Apple Inc.".
pub fn parse_research_request(params: &Value) -> Option<ResearchRequest> {
    if let Some(ticker) = params.get("ticker").and_then(Value::as_str) {
        let ticker = ticker.trim();
        if ticker.is_empty() {
            return None;
        }
        let company_name = params
            .get("company_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Some(ResearchRequest {
            ticker: ticker.to_uppercase(),
            company_name: company_name.trim().to_string(),
        });
    }

    let text = params
        .get("message")?
        .get("parts")?
        .as_array()?
        .iter()
        .find(|part| part.get("type").and_then(Value::as_str) == Some("text"))?
        .get("text")?
        .as_str()?;
    parse_research_text(text)
}

/// "TICKER Company Name" when the first word looks like a ticker; otherwise
/// the whole text is the company and the ticker is derived from it.
pub fn parse_research_text(text: &str) -> Option<ResearchRequest> {
    let text = strip_command_word(text.trim());
    if text.is_empty() {
        return None;
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() >= 2 && looks_like_ticker(words[0]) {
        return Some(ResearchRequest {
            ticker: words[0].to_string(),
            company_name: words[1..].join(" "),
        });
    }

    let ticker: String = text
        .to_uppercase()
        .chars()
        .filter(|c| *c != ' ')
        .take(MAX_TICKER_LEN)
        .collect();
    Some(ResearchRequest {
        ticker,
        company_name: text.to_string(),
    })
}

/// Drop a leading "research" when it stands as a word of its own.
fn strip_command_word(text: &str) -> &str {
    let Some(head) = text.get(..COMMAND_WORD.len()) else {
        return text;
    };
    let rest = &text[COMMAND_WORD.len()..];
    if head.eq_ignore_ascii_case(COMMAND_WORD) && rest.chars().next().map_or(true, char::is_whitespace) {
        rest.trim()
    } else {
        text
    }
}

fn looks_like_ticker(word: &str) -> bool {
    word.chars().count() <= MAX_TICKER_LEN
        && word.chars().any(char::is_uppercase)
        && !word.chars().any(char::is_lowercase)
}

/// Dispatches JSON-RPC requests to a [`TaskEngine`].
#[derive(Clone)]
pub struct FrontDoor {
    engine: TaskEngine,
}

impl FrontDoor {
    pub fn new(engine: TaskEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Handle one raw line. Lines that are not JSON get a parse error.
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(error = %e, "Unparseable request line");
                Some(response(
                    Value::Null,
                    Err(RpcError::new(PARSE_ERROR, "Parse error")),
                ))
            }
        }
    }

    /// Dispatch one request. Notifications (no `id` member) are still
    /// executed but produce no response.
    pub async fn handle(&self, request: Value) -> Option<Value> {
        let outcome = self.dispatch(&request).await;
        if is_notification(&request) {
            if let Err(error) = outcome {
                debug!(code = error.code, error = %error.message, "Notification failed");
            }
            return None;
        }
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        Some(response(id, outcome))
    }

    async fn dispatch(&self, request: &Value) -> Result<Value, RpcError> {
        if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(RpcError::new(
                INVALID_REQUEST,
                "Invalid Request: must be JSON-RPC 2.0",
            ));
        }
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_REQUEST, "Invalid Request: method missing"))?;

        let empty = json!({});
        let params = match request.get("params") {
            None | Some(Value::Null) => &empty,
            Some(params @ Value::Object(_)) => params,
            Some(_) => return Err(RpcError::invalid_params("params must be an object")),
        };

        match method {
            "message/send" => self.message_send(params).await,
            "tasks/get" => self.tasks_get(params).await,
            "tasks/cancel" => self.tasks_cancel(params).await,
            "health" => Ok(self.health()),
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    async fn message_send(&self, params: &Value) -> Result<Value, RpcError> {
        let request = parse_research_request(params).ok_or_else(|| {
            RpcError::invalid_params("Invalid params: could not parse company/ticker")
        })?;

        let id = self
            .engine
            .submit(&request.ticker, &request.company_name)
            .await;
        let task = self.engine.status(&id).await?;
        info!(task_id = %id, ticker = %task.ticker, "Research task created");

        Ok(json!({"task": {"id": task.id, "status": task.status}}))
    }

    async fn tasks_get(&self, params: &Value) -> Result<Value, RpcError> {
        let id = task_id(params)?;
        let task = self.engine.status(&id).await?;
        let task = serde_json::to_value(&task)
            .map_err(|e| RpcError::new(INTERNAL_ERROR, format!("Unserializable task: {e}")))?;
        Ok(json!({ "task": task }))
    }

    async fn tasks_cancel(&self, params: &Value) -> Result<Value, RpcError> {
        let id = task_id(params)?;
        self.engine.cancel(&id).await?;
        let task = self.engine.status(&id).await?;
        Ok(json!({"task": {
            "id": task.id,
            "status": task.status,
            "cancel_requested": task.cancel_requested,
        }}))
    }

    fn health(&self) -> Value {
        json!({
            "status": "ok",
            "tasks": self.engine.task_count(),
            "baskets": self.engine.basket_names(),
        })
    }
}

fn task_id(params: &Value) -> Result<TaskId, RpcError> {
    let raw = params
        .get("taskId")
        .or_else(|| params.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("Invalid params: taskId required"))?;
    raw.parse()
        .map_err(|_| RpcError::invalid_params(format!("Invalid params: bad taskId {raw}")))
}

fn is_notification(request: &Value) -> bool {
    request
        .as_object()
        .is_some_and(|fields| fields.contains_key("method") && !fields.contains_key("id"))
}

fn response(id: Value, outcome: Result<Value, RpcError>) -> Value {
    match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": error.code, "message": error.message},
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use fira_engine::test_support::ScriptedInvoker;
    use fira_models::config::default_baskets;
    use fira_models::EngineConfig;

    fn door(invoker: Arc<ScriptedInvoker>) -> FrontDoor {
        let engine =
            TaskEngine::new(EngineConfig::default(), &default_baskets(), invoker).unwrap();
        FrontDoor::new(engine)
    }

    fn rpc(id: u64, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    async fn wait_for(door: &FrontDoor, task_id: &str, status: &str) -> Value {
        for _ in 0..400 {
            let reply = door
                .handle(rpc(9, "tasks/get", json!({"taskId": task_id})))
                .await
                .unwrap();
            if reply["result"]["task"]["status"] == status {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[test]
    fn ticker_then_company() {
        assert_eq!(
            parse_research_text("Research AAPL Apple Inc."),
            Some(ResearchRequest {
                ticker: "AAPL".to_string(),
                company_name: "Apple Inc.".to_string()
            })
        );
        assert_eq!(
            parse_research_text("BRK.B Berkshire Hathaway").unwrap().ticker,
            "BRK.B"
        );
    }

    #[test]
    fn company_only_derives_ticker() {
        let request = parse_research_text("research Tesla").unwrap();
        assert_eq!(request.ticker, "TESLA");
        assert_eq!(request.company_name, "Tesla");

        let request = parse_research_text("Coca Cola Company").unwrap();
        assert_eq!(request.ticker, "COCAC");

        let request = parse_research_text("MSFT").unwrap();
        assert_eq!(request.ticker, "MSFT");
    }

    #[test]
    fn long_uppercase_word_is_not_a_ticker() {
        let request = parse_research_text("NVIDIA Corporation").unwrap();
        assert_eq!(request.ticker, "NVIDI");
        assert_eq!(request.company_name, "NVIDIA Corporation");
    }

    #[test]
    fn empty_text_is_rejected() {
        assert_eq!(parse_research_text("   "), None);
        assert_eq!(parse_research_text("Research   "), None);
        assert_eq!(parse_research_text("research"), None);
        assert_eq!(parse_research_text("RESEARCH"), None);
    }

    #[test]
    fn command_word_is_stripped_only_as_a_whole_word() {
        let request = parse_research_text("RESEARCH\tAAPL Apple Inc.").unwrap();
        assert_eq!(request.ticker, "AAPL");
        assert_eq!(request.company_name, "Apple Inc.");

        let request = parse_research_text("Researchers Inc").unwrap();
        assert_eq!(request.ticker, "RESEA");
        assert_eq!(request.company_name, "Researchers Inc");
    }

    #[test]
    fn explicit_params_take_precedence() {
        let params = json!({"ticker": " msft ", "company_name": "Microsoft", "message": {"parts": []}});
        let request = parse_research_request(&params).unwrap();
        assert_eq!(request.ticker, "MSFT");
        assert_eq!(request.company_name, "Microsoft");
    }

    #[test]
    fn message_parts_use_first_text_part() {
        let params = json!({"message": {"parts": [
            {"type": "file", "uri": "x"},
            {"type": "text", "text": "Research AAPL Apple Inc"}
        ]}});
        assert_eq!(parse_research_request(&params).unwrap().ticker, "AAPL");
        assert!(parse_research_request(&json!({"message": {"parts": []}})).is_none());
    }

    #[tokio::test]
    async fn send_then_get_until_completed() {
        let door = door(Arc::new(ScriptedInvoker::healthy()));
        let params = json!({"message": {"parts": [{"type": "text", "text": "Research AAPL Apple Inc."}]}});
        let reply = door.handle(rpc(1, "message/send", params)).await.unwrap();

        assert_eq!(reply["id"], 1);
        let task_id = reply["result"]["task"]["id"].as_str().unwrap().to_string();

        let done = wait_for(&door, &task_id, "completed").await;
        let task = &done["result"]["task"];
        assert_eq!(task["ticker"], "AAPL");
        assert_eq!(task["partial_events"].as_array().unwrap().len(), 6);
        assert_eq!(task["result"]["metrics"]["macro"]["gdp_growth"]["value"], 4.3);
        assert!(task.get("error").is_none());
    }

    #[tokio::test]
    async fn failed_task_reports_error() {
        let door = door(Arc::new(ScriptedInvoker::new()));
        let reply = door
            .handle(rpc(1, "message/send", json!({"ticker": "ZZZZ"})))
            .await
            .unwrap();
        let task_id = reply["result"]["task"]["id"].as_str().unwrap().to_string();

        let done = wait_for(&door, &task_id, "failed").await;
        assert!(done["result"]["task"]["error"]
            .as_str()
            .unwrap()
            .contains("baskets failed"));
        assert!(done["result"]["task"].get("result").is_none());
    }

    #[tokio::test]
    async fn cancel_running_task() {
        let invoker = Arc::new(ScriptedInvoker::healthy());
        let gate = invoker.gate("fundamentals");
        let door = door(invoker.clone());

        let reply = door
            .handle(rpc(1, "message/send", json!({"ticker": "AAPL"})))
            .await
            .unwrap();
        let task_id = reply["result"]["task"]["id"].as_str().unwrap().to_string();
        while invoker.call_count("fundamentals") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let cancel = door
            .handle(rpc(2, "tasks/cancel", json!({"taskId": task_id})))
            .await
            .unwrap();
        assert_eq!(cancel["result"]["task"]["cancel_requested"], true);

        gate.add_permits(1);
        let done = wait_for(&door, &task_id, "canceled").await;
        assert_eq!(
            done["result"]["task"]["partial_events"].as_array().unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn protocol_errors() {
        let door = door(Arc::new(ScriptedInvoker::new()));

        let reply = door.handle_line("{not json").await.unwrap();
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert_eq!(reply["id"], Value::Null);

        let reply = door
            .handle(json!({"jsonrpc": "1.0", "id": 3, "method": "health"}))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], INVALID_REQUEST);
        assert_eq!(reply["id"], 3);

        let reply = door.handle(rpc(4, "tasks/list", json!({}))).await.unwrap();
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);

        let reply = door.handle(rpc(5, "tasks/get", json!({}))).await.unwrap();
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);

        let reply = door
            .handle(rpc(6, "tasks/get", json!({"taskId": "not-a-uuid"})))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);

        let missing = TaskId::new_v4().to_string();
        let reply = door
            .handle(rpc(7, "tasks/cancel", json!({"taskId": missing})))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], TASK_NOT_FOUND);

        let reply = door
            .handle(rpc(8, "message/send", json!({"message": {"parts": []}})))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);

        let reply = door
            .handle(json!({"jsonrpc": "2.0", "id": 10, "method": "health", "params": [1]}))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let invoker = Arc::new(ScriptedInvoker::healthy());
        let door = door(invoker.clone());

        let reply = door
            .handle(json!({"jsonrpc": "2.0", "method": "message/send", "params": {"ticker": "AAPL"}}))
            .await;
        assert!(reply.is_none());
        // Still executed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while invoker.call_count("fundamentals") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let reply = door
            .handle_line(r#"{"jsonrpc": "2.0", "method": "tasks/list"}"#)
            .await;
        assert!(reply.is_none());

        let reply = door
            .handle(json!({"jsonrpc": "2.0", "id": null, "method": "health"}))
            .await
            .unwrap();
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["result"]["status"], "ok");
    }

    #[tokio::test]
    async fn health_lists_baskets() {
        let door = door(Arc::new(ScriptedInvoker::new()));
        let reply = door
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "health"}))
            .await
            .unwrap();
        assert_eq!(reply["result"]["status"], "ok");
        assert_eq!(reply["result"]["baskets"][0], "fundamentals");
        assert_eq!(reply["result"]["baskets"].as_array().unwrap().len(), 6);
    }
}
