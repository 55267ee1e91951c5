//! Protocol and application constants.

/// Application name.
pub const APP_NAME: &str = "msgr";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default web origin for HTTP calls and WebSocket headers.
pub const DEFAULT_BASE_URL: &str = "https://www.facebook.com";

/// Default MQTT-over-WebSocket gateway.
pub const DEFAULT_MQTT_HOST: &str = "wss://edge-chat.facebook.com/chat";

/// Path of the batched GraphQL endpoint.
pub const GRAPHQL_BATCH_PATH: &str = "/api/graphqlbatch/";

/// Persisted query id for the inbox cursor lookup.
pub const SEQ_ID_DOC_ID: &str = "3336396659757871";

/// MQTT client id expected by the gateway.
pub const MQTT_CLIENT_ID: &str = "mqttwsclient";

/// Application id carried in the connection identity blob.
pub const MQTT_APP_ID: &str = "219994525426954";

/// Application id carried in `/ls_req` task envelopes.
pub const TASK_APP_ID: &str = "2220391788200892";

/// Default user agent for HTTP and WebSocket requests.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 12; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// Default forced reconnect period (one hour).
pub const DEFAULT_CYCLE_MS: i64 = 60 * 60 * 1000;

/// Default delay before a scheduled reconnect.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;

/// Default lifetime of a pending task.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;

/// Default MQTT keepalive.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 10;

/// How long the transport may take to acknowledge the MQTT connect.
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// How long to wait for the first `/t_ms` frame after subscribing.
pub const SYNC_ACK_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on unsubscribe-all during teardown.
pub const UNSUBSCRIBE_TIMEOUT_MS: u64 = 3_000;

/// Largest MQTT packet accepted or sent.
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// MQTT topic names used by the listener.
pub mod topics {
    pub const LEGACY_WEB: &str = "/legacy_web";
    pub const WEBRTC: &str = "/webrtc";
    pub const RTC_MULTI: &str = "/rtc_multi";
    pub const ONEVC: &str = "/onevc";
    pub const BR_SR: &str = "/br_sr";
    pub const SR_RES: &str = "/sr_res";
    pub const SYNC: &str = "/t_ms";
    pub const THREAD_TYPING: &str = "/thread_typing";
    pub const ORCA_TYPING: &str = "/orca_typing_notifications";
    pub const NOTIFY_DISCONNECT: &str = "/notify_disconnect";
    pub const PRESENCE: &str = "/orca_presence";
    pub const INBOX: &str = "/inbox";
    pub const MERCURY: &str = "/mercury";
    pub const MESSAGING_EVENTS: &str = "/messaging_events";
    pub const ORCA_MESSAGE_NOTIFICATIONS: &str = "/orca_message_notifications";
    pub const PP: &str = "/pp";
    pub const WEBRTC_RESPONSE: &str = "/webrtc_response";
    pub const TASK_RESPONSE: &str = "/ls_resp";

    /// Publish-only topics.
    pub const TASK_REQUEST: &str = "/ls_req";
    pub const SYNC_CREATE_QUEUE: &str = "/messenger_sync_create_queue";
    pub const SYNC_GET_DIFFS: &str = "/messenger_sync_get_diffs";
    pub const FOREGROUND_STATE: &str = "/foreground_state";
    pub const CLIENT_SETTINGS: &str = "/set_client_settings";

    /// Every topic subscribed on connect, in subscription order.
    pub const SUBSCRIBED: &[&str] = &[
        LEGACY_WEB,
        WEBRTC,
        RTC_MULTI,
        ONEVC,
        BR_SR,
        SR_RES,
        SYNC,
        THREAD_TYPING,
        ORCA_TYPING,
        NOTIFY_DISCONNECT,
        PRESENCE,
        INBOX,
        MERCURY,
        MESSAGING_EVENTS,
        ORCA_MESSAGE_NOTIFICATIONS,
        PP,
        WEBRTC_RESPONSE,
        TASK_RESPONSE,
    ];
}

/// Queue-sync request parameters.
pub mod sync {
    pub const API_VERSION: u32 = 10;
    pub const MAX_DELTAS: u32 = 1000;
    pub const DELTA_BATCH_SIZE: u32 = 500;
    pub const ENCODING: &str = "JSON";
}
