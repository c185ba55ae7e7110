//! Minimal agent wiring one plugin through a full turn.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_kernel::{
    Action, ActionHandlerResult, ActionOptions, ActionOutcome, AgentRuntime, KernelResult,
    ModelRegistration, Plugin, Provider, TEXT_LARGE, TurnContext,
};
use agent_primitives::{
    ActionResult, Character, Content, EntityId, Memory, MemoryKind, ProviderOutput, RoomId, State,
    now_millis,
};
use agent_store::{LocalStore, MemoryQuery, StoreAdapter};

/// Demo command-line arguments.
#[derive(Parser, Debug)]
struct Args {
    /// Optional agent name override.
    #[arg(long)]
    name: Option<String>,
}

struct TimeProvider;

#[async_trait]
impl Provider for TimeProvider {
    fn name(&self) -> &str {
        "TIME"
    }

    async fn get(
        &self,
        _runtime: &AgentRuntime,
        _message: &Memory,
        _state: &State,
    ) -> KernelResult<ProviderOutput> {
        let mut output = ProviderOutput::from_text(format!("The time is {}.", now_millis()));
        output.values.insert("now".into(), json!(now_millis()));
        Ok(output)
    }
}

struct GreetAction;

#[async_trait]
impl Action for GreetAction {
    fn name(&self) -> &str {
        "GREET"
    }

    async fn handle(
        &self,
        runtime: &AgentRuntime,
        message: &Memory,
        state: &State,
        options: &ActionOptions,
        _responses: &[Memory],
    ) -> ActionHandlerResult {
        let prompt = format!(
            "{}\nUser says: {}\nReply with a short greeting.",
            state.text,
            message.content.text.as_deref().unwrap_or_default()
        );
        let reply = runtime
            .use_model(&options.turn, TEXT_LARGE, json!({ "prompt": prompt }), None)
            .await
            .map_err(|err| agent_kernel::ActionError::failed(err.to_string()))?;
        let text = reply.as_str().unwrap_or("Hello!").to_owned();
        Ok(ActionOutcome::Structured(ActionResult::ok().with_text(text)))
    }
}

fn demo_plugin() -> Plugin {
    Plugin::new("demo", "Greeting demo plugin")
        .with_provider(Arc::new(TimeProvider))
        .with_action(Arc::new(GreetAction))
        .with_model(ModelRegistration::new(
            TEXT_LARGE,
            Arc::new(|params: Value| async move {
                let prompt = params["prompt"].as_str().unwrap_or_default().to_owned();
                info!(chars = prompt.len(), "demo model invoked");
                Ok::<_, agent_kernel::ModelError>(Value::from("Hello there, nice to meet you!"))
            }),
        ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();

    let character = Character::builder(args.name.unwrap_or_else(|| "Conversa".into()))
        .bio("A demonstration agent that greets people.")
        .system("Answer briefly and kindly.")
        .build()?;

    let store = Arc::new(LocalStore::new());
    let runtime = AgentRuntime::builder(character)
        .store(Arc::clone(&store) as Arc<dyn StoreAdapter>)
        .plugin(demo_plugin())
        .build();
    runtime.initialize().await?;
    info!(agent_id = %runtime.agent_id(), "agent ready");

    // One inbound message and one response declaring the GREET action.
    let room_id = RoomId::random();
    let message = Memory::message(
        EntityId::random(),
        room_id,
        Content::from_text("hi there!"),
    );
    let response = Memory::message(
        EntityId::from_uuid(runtime.agent_id().as_uuid()),
        room_id,
        Content::from_text("greeting the user")
            .with_actions(["GREET"])
            .with_thought("The user greeted me, I should greet back."),
    );

    let turn = Arc::new(TurnContext::new());
    let state = runtime.compose_state(&message, &[], false, false).await?;
    info!(context = %state.text, "state composed");

    runtime
        .process_actions(&turn, &message, std::slice::from_ref(&response), Some(state.clone()), None)
        .await?;
    runtime
        .evaluate(&turn, &message, &state, true, &[response], None)
        .await?;

    let results = store
        .get_memories(&MemoryQuery::table("messages").in_room(room_id))
        .await?;
    for memory in results
        .iter()
        .filter(|m| m.metadata.kind == MemoryKind::ActionResult)
    {
        info!(
            action = memory.metadata.action_name.as_deref().unwrap_or("?"),
            text = memory.content.text.as_deref().unwrap_or(""),
            "action result"
        );
    }

    runtime.close().await?;
    Ok(())
}
