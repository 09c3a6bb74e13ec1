use std::sync::Arc;

use shellmux_llm_api::LlmClient;

/// A text-generation provider in its configured role
#[derive(Clone)]
pub enum Capability {
    Primary(Arc<dyn LlmClient>),
    Fallback(Arc<dyn LlmClient>),
}

impl Capability {
    pub fn client(&self) -> &dyn LlmClient {
        match self {
            Capability::Primary(client) | Capability::Fallback(client) => client.as_ref(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Capability::Primary(_) => "primary",
            Capability::Fallback(_) => "fallback",
        }
    }

    /// A caller-supplied model only applies to the primary; the fallback
    /// always uses its own configured model.
    pub fn model_override<'a>(&self, requested: Option<&'a str>) -> Option<&'a str> {
        match self {
            Capability::Primary(_) => requested,
            Capability::Fallback(_) => None,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.role(), self.client().name())
    }
}
