use trio_core::AgentRunner;
use trio_providers::ProviderRegistry;

mod http;

pub use http::serve;

#[derive(Clone)]
pub struct AppState {
    pub runner: AgentRunner,
    pub providers: ProviderRegistry,
    api_token: Option<String>,
}

impl AppState {
    pub fn new(runner: AgentRunner, providers: ProviderRegistry, api_token: Option<String>) -> Self {
        Self {
            runner,
            providers,
            api_token: api_token.filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }
}
