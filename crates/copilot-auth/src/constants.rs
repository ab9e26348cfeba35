//! Upstream endpoints and protocol constants

/// Token-exchange endpoint. Lives on api.github.com, not on the inference
/// API host: refresh credentials are GitHub tokens, access tokens are
/// Copilot tokens.
pub const TOKEN_ENDPOINT: &str = "https://api.github.com/copilot_internal/v2/token";

/// Base URL of the Copilot inference API.
pub const API_BASE_URL: &str = "https://api.individual.githubcopilot.com";

/// Chat-completions path under the API base.
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Model-listing path under the API base.
pub const MODELS_PATH: &str = "/models";

/// Editor identity the upstream expects on every call, token exchange
/// included.
pub const EDITOR_VERSION: &str = "vscode/1.95.3";
