use trellis::prelude::*;

struct Echo;

#[async_trait::async_trait]
impl ModelExecutor for Echo {
    async fn execute(&self, request: LlmRequest) -> Result<LlmResponse, TrellisError> {
        let last = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(LlmResponse::text(format!("echo: {last}")))
    }
}

#[tokio::test]
async fn prelude_is_enough_to_run_an_agent() {
    let mut agent = AgentBuilder::single_run()
        .unwrap()
        .executor(Echo)
        .install::<TraceFeature>(TraceConfig::default())
        .build()
        .unwrap();

    let answer = agent.run("hi".to_string()).await.unwrap();

    assert_eq!(answer, "echo: hi");
    assert!(matches!(agent.state(), AgentState::Finished(_)));
    assert!(!agent.feature::<TraceFeature>().unwrap().spans().is_empty());
}

#[test]
fn core_types_are_reexported_at_the_root() {
    let message = trellis::Message::user("hello");
    assert_eq!(message.role, trellis::Role::User);
}
