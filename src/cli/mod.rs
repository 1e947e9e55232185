use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP API. Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    // --- Store Args ---
    /// Chat store type (memory, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "memory")]
    pub store_type: String,

    /// Redis endpoint for the chat store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_redis_url: String,

    /// Prefix for Redis chat store keys.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "chat:")]
    pub store_redis_prefix: String,

    /// Default page size for message history queries.
    #[arg(long, env = "PAGE_LIMIT", default_value = "50")]
    pub page_limit: usize,

    /// Seed a demo roster of users into the directory on startup.
    #[arg(long, env = "SEED_DEMO_USERS", default_value = "false")]
    pub seed_demo_users: bool,

    // --- Agent LLM Provider Args ---
    /// Type of LLM provider backing the agent (ollama, openai)
    #[arg(long, env = "AGENT_LLM_TYPE", default_value = "ollama")]
    pub agent_llm_type: String,

    /// Base URL for the agent's LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "AGENT_BASE_URL")] // No default, let adapters handle defaults if None
    pub agent_base_url: Option<String>,

    /// API Key for the agent's LLM provider (e.g., OpenAI)
    #[arg(long, env = "AGENT_API_KEY", default_value = "")]
    pub agent_api_key: String,

    /// Model name for the agent (e.g., gpt-4o-mini, llama3)
    #[arg(long, env = "AGENT_MODEL")] // No default, rely on adapter defaults if None
    pub agent_model: Option<String>,

    // --- Agent Identity Args ---
    /// Fixed user id of the resident agent.
    #[arg(long, env = "AGENT_USER_ID", default_value = "user_ai_wa")]
    pub agent_user_id: String,

    /// Display name of the resident agent.
    #[arg(long, env = "AGENT_DISPLAY_NAME", default_value = "Wa")]
    pub agent_display_name: String,

    /// System prompt prepended to every agent turn.
    #[arg(
        long,
        env = "AGENT_SYSTEM_PROMPT",
        default_value = "You are Wa, a friendly assistant in a group chat. Keep replies short and conversational."
    )]
    pub agent_system_prompt: String,

    /// Message sent in place of a reply when the upstream model fails.
    #[arg(
        long,
        env = "AGENT_FALLBACK_TEXT",
        default_value = "Sorry, I'm having trouble responding right now."
    )]
    pub agent_fallback_text: String,

    /// How many recent messages the agent sees as context.
    #[arg(long, env = "AGENT_HISTORY_DEPTH", default_value = "10")]
    pub agent_history_depth: usize,

    /// Maximum concurrent upstream model calls across all conversations.
    #[arg(long, env = "AGENT_MAX_CONCURRENT", default_value = "4")]
    pub agent_max_concurrent: usize,

    // --- TLS Args ---
    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}
