pub mod agent;
pub mod cli;
pub mod error;
pub mod fanout;
pub mod llm;
pub mod mention;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod store;

use agent::{AgentIdentity, AgentOrchestrator};
use cli::Args;
use fanout::Fanout;
use llm::{LlmConfig, LlmType};
use log::info;
use models::chat::UserProfile;
use pipeline::ChatService;
use server::Server;
use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Store Type: {}", args.store_type);
    if args.store_type.eq_ignore_ascii_case("redis") {
        info!("Store Redis URL: {}", args.store_redis_url);
    }
    info!("Agent LLM Type: {}", args.agent_llm_type);
    info!(
        "Agent User: {} ({})",
        args.agent_display_name, args.agent_user_id
    );
    info!("Agent History Depth: {}", args.agent_history_depth);
    info!("Agent Max Concurrent Turns: {}", args.agent_max_concurrent);
    if let Some(port) = args.http_port {
        info!("HTTP API Port: {}", port);
    }
    info!("-------------------------");

    let stores = store::create_stores(&args)?;

    let identity = AgentIdentity {
        user_id: args.agent_user_id.clone(),
        display_name: args.agent_display_name.clone(),
    };
    stores.directory.upsert(&identity.profile()).await?;

    if args.seed_demo_users {
        seed_demo_users(stores.directory.as_ref()).await?;
    }

    let llm_config = LlmConfig {
        llm_type: LlmType::from_str(&args.agent_llm_type)?,
        api_key: Some(args.agent_api_key.clone()).filter(|k| !k.is_empty()),
        model: args.agent_model.clone(),
        base_url: args.agent_base_url.clone(),
    };
    let client = llm::chat::new_client(&llm_config)?;

    let fanout = Arc::new(Fanout::new());
    let orchestrator = Arc::new(AgentOrchestrator::new(
        client,
        stores.messages.clone(),
        stores.conversations.clone(),
        stores.directory.clone(),
        fanout.clone(),
        identity,
        args.agent_system_prompt.clone(),
        args.agent_fallback_text.clone(),
        args.agent_history_depth,
        args.agent_max_concurrent,
    ));

    let service = Arc::new(ChatService::new(
        stores.messages,
        stores.conversations,
        stores.directory,
        fanout.clone(),
        orchestrator,
        args.page_limit,
    ));

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, service, fanout, args.clone());
    server.run().await?;

    Ok(())
}

/// A small fixed roster for local development, so mentions and directs have
/// someone to hit without an account system in front.
async fn seed_demo_users(
    directory: &dyn store::UserDirectory,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let roster = [
        ("user_alice", "alice", "Alice Zhang", "alice@example.com"),
        ("user_bob", "bob", "Bob Tan", "bob@example.com"),
        ("user_carol", "carol", "Carol Lim", "carol@example.com"),
        ("user_dave", "dave", "Dave Ng", "dave@example.com"),
    ];
    for (id, handle, name, email) in roster {
        directory
            .upsert(&UserProfile {
                id: id.to_string(),
                handle: handle.to_string(),
                display_name: name.to_string(),
                avatar_url: String::new(),
                email: email.to_string(),
            })
            .await?;
    }
    info!("Seeded {} demo users", roster.len());
    Ok(())
}
