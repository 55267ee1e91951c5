//! Wire payloads exchanged with the gateway.
//!
//! Everything here is a pure function of the session and configuration so
//! the exact bytes can be checked without a live connection.

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use msgr_api::Credentials;
use msgr_core::config::{ProxySettings, TransportConfig};
use msgr_core::constants::{self, sync, topics};
use msgr_core::error::{MsgrError, MsgrResult};

/// Largest session id the gateway accepts (2^53 - 1).
const MAX_SESSION_ID: u64 = (1 << 53) - 1;

/// Everything a `Connector` needs to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub endpoint: String,
    /// Serialized identity blob sent as the MQTT username.
    pub username: String,
    pub keep_alive_secs: u64,
    /// Extra headers for the WebSocket upgrade request.
    pub headers: Vec<(String, String)>,
    pub proxy: Option<ProxySettings>,
    pub session_id: u64,
}

/// Random per-connection session id in `1..=2^53-1`.
pub fn random_session_id() -> u64 {
    rand::thread_rng().gen_range(1..=MAX_SESSION_ID)
}

/// Gateway URL for one connection.
///
/// An explicit endpoint already carries its own query string, so only the
/// session and client ids are appended.
pub fn endpoint_url(config: &TransportConfig, session_id: u64, client_id: &str) -> String {
    let explicit = config.mqtt_endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty());
    let region = config.region.as_deref().map(str::trim).filter(|r| !r.is_empty());
    match (explicit, region) {
        (Some(endpoint), _) => format!("{endpoint}&sid={session_id}&cid={client_id}"),
        (None, Some(region)) => format!(
            "{}?region={}&sid={session_id}&cid={client_id}",
            constants::DEFAULT_MQTT_HOST,
            region.to_lowercase()
        ),
        (None, None) => format!(
            "{}?sid={session_id}&cid={client_id}",
            constants::DEFAULT_MQTT_HOST
        ),
    }
}

/// Identity blob carried in the MQTT username field.
#[derive(Debug, Serialize)]
struct Identity<'a> {
    u: &'a str,
    s: u64,
    chat_on: bool,
    fg: bool,
    d: &'a str,
    ct: &'static str,
    aid: &'static str,
    aids: Option<Value>,
    mqtt_sid: &'static str,
    cp: u32,
    ecp: u32,
    st: Vec<Value>,
    pm: Vec<Value>,
    dc: &'static str,
    no_auto_fg: bool,
    gas: Option<Value>,
    pack: Vec<Value>,
    p: Option<Value>,
    php_override: &'static str,
}

pub fn identity_username(
    user_id: &str,
    client_id: &str,
    session_id: u64,
    online: bool,
) -> MsgrResult<String> {
    let identity = Identity {
        u: user_id,
        s: session_id,
        chat_on: online,
        fg: online,
        d: client_id,
        ct: "websocket",
        aid: constants::MQTT_APP_ID,
        aids: None,
        mqtt_sid: "",
        cp: 3,
        ecp: 10,
        st: Vec::new(),
        pm: Vec::new(),
        dc: "",
        no_auto_fg: true,
        gas: None,
        pack: Vec::new(),
        p: None,
        php_override: "",
    };
    Ok(serde_json::to_string(&identity)?)
}

/// Build the parameters for a fresh connection.
pub fn connect_params(
    credentials: &Credentials,
    config: &TransportConfig,
    online: bool,
) -> MsgrResult<ConnectParams> {
    let session_id = random_session_id();
    let endpoint = endpoint_url(config, session_id, &credentials.client_id);
    let username = identity_username(&credentials.user_id, &credentials.client_id, session_id, online)?;

    let uri: http::Uri = endpoint
        .parse()
        .map_err(|e| MsgrError::Config(format!("invalid mqtt endpoint {endpoint:?}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| MsgrError::Config(format!("mqtt endpoint {endpoint:?} has no host")))?
        .to_string();

    let origin = credentials.origin().as_str().trim_end_matches('/').to_string();
    let mut headers = vec![
        ("Origin".to_string(), origin.clone()),
        ("User-Agent".to_string(), config.user_agent.clone()),
        ("Referer".to_string(), format!("{origin}/")),
        ("Host".to_string(), host),
    ];
    if let Some(cookie) = credentials.cookie_header() {
        headers.insert(0, ("Cookie".to_string(), cookie));
    }

    Ok(ConnectParams {
        endpoint,
        username,
        keep_alive_secs: config.keep_alive_secs,
        headers,
        proxy: config.proxy_settings()?,
        session_id,
    })
}

#[derive(Debug, Serialize)]
struct QueueRequest<'a> {
    sync_api_version: u32,
    max_deltas_able_to_process: u32,
    delta_batch_size: u32,
    encoding: &'static str,
    entity_fbid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_titan_sequence_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seq_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync_token: Option<&'a str>,
    device_params: Option<Value>,
}

/// Topic and body of the queue-sync request.
///
/// Without a continuation token a new queue is created from the bootstrap
/// cursor; with one the existing queue is resumed.
pub fn queue_request(
    user_id: &str,
    last_seq_id: Option<i64>,
    sync_token: Option<&str>,
) -> MsgrResult<(&'static str, Vec<u8>)> {
    let base = QueueRequest {
        sync_api_version: sync::API_VERSION,
        max_deltas_able_to_process: sync::MAX_DELTAS,
        delta_batch_size: sync::DELTA_BATCH_SIZE,
        encoding: sync::ENCODING,
        entity_fbid: user_id,
        initial_titan_sequence_id: None,
        last_seq_id: None,
        sync_token: None,
        device_params: None,
    };
    match sync_token {
        Some(token) => {
            let request = QueueRequest {
                last_seq_id,
                sync_token: Some(token),
                ..base
            };
            Ok((topics::SYNC_GET_DIFFS, serde_json::to_vec(&request)?))
        }
        None => {
            let request = QueueRequest {
                initial_titan_sequence_id: last_seq_id,
                ..base
            };
            Ok((topics::SYNC_CREATE_QUEUE, serde_json::to_vec(&request)?))
        }
    }
}

pub fn foreground_state(online: bool) -> Vec<u8> {
    serde_json::json!({ "foreground": online }).to_string().into_bytes()
}

pub fn client_settings() -> Vec<u8> {
    serde_json::json!({ "make_user_available_when_in_foreground": true })
        .to_string()
        .into_bytes()
}

/// `/ls_req` envelope; the inner payload travels as a JSON string.
pub fn task_envelope(request_id: u64, payload: &Value) -> Vec<u8> {
    serde_json::json!({
        "app_id": constants::TASK_APP_ID,
        "payload": payload.to_string(),
        "request_id": request_id,
        "type": 3,
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::from_cookie_header("c_user=100; xs=secret", constants::DEFAULT_BASE_URL).unwrap()
    }

    #[test]
    fn test_session_id_range() {
        for _ in 0..100 {
            let sid = random_session_id();
            assert!(sid >= 1 && sid <= MAX_SESSION_ID);
        }
    }

    #[test]
    fn test_endpoint_variants() {
        let mut config = TransportConfig::default();
        assert_eq!(
            endpoint_url(&config, 7, "ab"),
            "wss://edge-chat.facebook.com/chat?sid=7&cid=ab"
        );

        config.region = Some("PRN".into());
        assert_eq!(
            endpoint_url(&config, 7, "ab"),
            "wss://edge-chat.facebook.com/chat?region=prn&sid=7&cid=ab"
        );

        config.mqtt_endpoint = Some("wss://edge-chat.facebook.com/chat?region=atn".into());
        assert_eq!(
            endpoint_url(&config, 7, "ab"),
            "wss://edge-chat.facebook.com/chat?region=atn&sid=7&cid=ab"
        );
    }

    #[test]
    fn test_identity_blob_fields() {
        let blob: Value = serde_json::from_str(&identity_username("100", "ab", 42, true).unwrap()).unwrap();
        assert_eq!(blob["u"], "100");
        assert_eq!(blob["s"], 42);
        assert_eq!(blob["d"], "ab");
        assert_eq!(blob["ct"], "websocket");
        assert_eq!(blob["aid"], "219994525426954");
        assert_eq!(blob["cp"], 3);
        assert_eq!(blob["ecp"], 10);
        assert_eq!(blob["chat_on"], true);
        assert_eq!(blob["no_auto_fg"], true);
        assert!(blob["aids"].is_null());
        assert!(blob["gas"].is_null());
        assert_eq!(blob["st"], serde_json::json!([]));
        assert_eq!(blob["php_override"], "");
    }

    #[test]
    fn test_connect_params_headers() {
        let params = connect_params(&creds(), &TransportConfig::default(), true).unwrap();
        let header = |name: &str| {
            params
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert!(header("Cookie").unwrap().contains("c_user=100"));
        assert_eq!(header("Origin").unwrap(), "https://www.facebook.com");
        assert_eq!(header("Host").unwrap(), "edge-chat.facebook.com");
        assert!(params.endpoint.contains(&format!("sid={}", params.session_id)));
        assert!(params.proxy.is_none());
    }

    #[test]
    fn test_create_queue_payload() {
        let (topic, body) = queue_request("100", Some(4242), None).unwrap();
        assert_eq!(topic, "/messenger_sync_create_queue");
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["sync_api_version"], 10);
        assert_eq!(json["max_deltas_able_to_process"], 1000);
        assert_eq!(json["delta_batch_size"], 500);
        assert_eq!(json["encoding"], "JSON");
        assert_eq!(json["entity_fbid"], "100");
        assert_eq!(json["initial_titan_sequence_id"], 4242);
        assert!(json["device_params"].is_null());
        assert!(json.get("sync_token").is_none());
    }

    #[test]
    fn test_resume_queue_payload() {
        let (topic, body) = queue_request("100", Some(105), Some("tok-1")).unwrap();
        assert_eq!(topic, "/messenger_sync_get_diffs");
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["last_seq_id"], 105);
        assert_eq!(json["sync_token"], "tok-1");
        assert!(json.get("initial_titan_sequence_id").is_none());
    }

    #[test]
    fn test_control_payloads() {
        assert_eq!(foreground_state(false), br#"{"foreground":false}"#.to_vec());
        assert_eq!(
            client_settings(),
            br#"{"make_user_available_when_in_foreground":true}"#.to_vec()
        );
    }

    #[test]
    fn test_task_envelope() {
        let body = task_envelope(9, &serde_json::json!({"k": 1}));
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["app_id"], "2220391788200892");
        assert_eq!(json["payload"], r#"{"k":1}"#);
        assert_eq!(json["request_id"], 9);
        assert_eq!(json["type"], 3);
    }
}
