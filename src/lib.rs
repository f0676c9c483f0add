#![forbid(unsafe_code)]
#![doc = r#"
InferSwitch

API gateway that terminates the Anthropic Messages wire format (plus an
OpenAI Chat Completions shim) and forwards to Anthropic, OpenAI, OpenRouter,
LM-Studio or any OpenAI-compatible endpoint.

Crate highlights
- Content-aware routing: explicit pins, expert/difficulty classification,
  direct model maps, prefix patterns and a configured fallback.
- Idempotent response cache keyed on a normalized request fingerprint;
  streaming and unary requests share entries.
- Automatic failover across an ordered candidate list with temporary
  cool-down of rate-limited models.
- Transparent Anthropic ⇄ OpenAI translation, streaming included.
- OAuth bearer channel for Anthropic alongside static API keys.

Modules
- `models`: Anthropic and OpenAI wire shapes.
- `conversion`: pure format translation, streaming translators.
- `config`: layered configuration snapshot.
- `router` / `classifier`: candidate selection.
- `adapter` / `anthropic` / `openai_compat`: upstream capability.
- `cache` / `availability`: shared gateway state.
- `pipeline`: the orchestrator.
- `server`: actix handlers (the binary uses this).
- `oauth`: Anthropic OAuth collaborator.
"#]

pub mod adapter;
pub mod anthropic;
pub mod availability;
pub mod cache;
pub mod chat_template;
pub mod classifier;
pub mod config;
pub mod conversion;
pub mod models;
pub mod oauth;
pub mod openai_compat;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod util;

pub use crate::adapter::{Adapter, AdapterError, AdapterRegistry, ErrorKind, RequestAuth};
pub use crate::availability::AvailabilityRegistry;
pub use crate::cache::{fingerprint, ResponseCache};
pub use crate::classifier::{Classifier, KeywordClassifier};
pub use crate::config::{BackendConfig, BackendKind, GatewayConfig, RoutingMode};
pub use crate::pipeline::{PipelineReply, RequestPipeline};
pub use crate::router::{Candidate, ModelRouter, RouteDecision};
pub use crate::util::AppState;
