//! Built-in provider signatures
//!
//! Vendors with their own hosts come first. `openai` follows with a host
//! pattern that accepts anything, so OpenAI-compatible gateways are captured.
//! Local tooling (`ollama`, `google_adk`) is last and only reached for paths
//! that `openai` does not claim.

use super::{ResponseShape, SignatureSpec};

struct Builtin {
    name: &'static str,
    paths: &'static [&'static str],
    hosts: &'static [&'static str],
    shape: ResponseShape,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "anthropic",
        paths: &[r"/v1/messages", r"/v1/complete"],
        hosts: &[r"api\.anthropic\.com"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "gemini",
        paths: &[
            r"/v1beta/models/.+:generateContent",
            r"/v1beta/models/.+:streamGenerateContent",
            r"/v1beta/models/.+:countTokens",
            r"/v1beta/models/.+:embedContent",
            r"/v1/models/.+:generateContent",
            r"/v1/models/.+:streamGenerateContent",
            r"/v1/projects/.+/locations/.+/publishers/.+/models/.+:predict",
            r"/v1/projects/.+/locations/.+/publishers/.+/models/.+:streamPredict",
            r"/v1/projects/.+/locations/.+/publishers/.+/models/.+:generateContent",
        ],
        hosts: &[
            r"generativelanguage\.googleapis\.com",
            r".*-aiplatform\.googleapis\.com",
        ],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "bedrock",
        paths: &[
            r"/model/.+/invoke",
            r"/model/.+/invoke-with-response-stream",
            r"/model/.+/converse",
            r"/model/.+/converse-stream",
        ],
        hosts: &[
            r"bedrock-runtime\..*\.amazonaws\.com",
            r"bedrock\..*\.amazonaws\.com",
        ],
        // AWS event-stream framing is binary
        shape: ResponseShape::Raw,
    },
    Builtin {
        name: "azure_openai",
        paths: &[
            r"/openai/deployments/.+/chat/completions",
            r"/openai/deployments/.+/completions",
            r"/openai/deployments/.+/embeddings",
            r"/openai/deployments/.+/images/generations",
            r"/openai/deployments/.+/audio/transcriptions",
            r"/openai/deployments/.+/audio/translations",
        ],
        hosts: &[r".*\.openai\.azure\.com", r".*\.azure-api\.net"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "wandb_inference",
        paths: &[r"/v1/chat/completions", r"/v1/completions", r"/v1/embeddings"],
        hosts: &[r".*\.wandb\.ai", r"api\.wandb\.ai"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "cohere",
        paths: &[
            r"/v1/chat",
            r"/v1/generate",
            r"/v1/embed",
            r"/v1/rerank",
            r"/v1/summarize",
        ],
        hosts: &[r"api\.cohere\.ai", r"api\.cohere\.com"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "mistral",
        paths: &[
            r"/v1/chat/completions",
            r"/v1/embeddings",
            r"/v1/fim/completions",
        ],
        hosts: &[r"api\.mistral\.ai"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "groq",
        paths: &[r"/openai/v1/chat/completions", r"/v1/chat/completions"],
        hosts: &[r"api\.groq\.com"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "together",
        paths: &[
            r"/v1/chat/completions",
            r"/v1/completions",
            r"/v1/embeddings",
            r"/inference",
        ],
        hosts: &[r"api\.together\.xyz", r".*\.together\.ai"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "replicate",
        paths: &[r"/v1/predictions", r"/v1/models/.+/predictions"],
        hosts: &[r"api\.replicate\.com"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "fireworks",
        paths: &[
            r"/inference/v1/chat/completions",
            r"/inference/v1/completions",
            r"/inference/v1/embeddings",
        ],
        hosts: &[r"api\.fireworks\.ai"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "perplexity",
        paths: &[r"/chat/completions"],
        hosts: &[r"api\.perplexity\.ai"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "openai",
        paths: &[
            r"/v1/chat/completions",
            r"/v1/completions",
            r"/v1/responses",
            r"/v1/embeddings",
            r"/v1/assistants",
            r"/v1/threads",
            r"/v1/threads/.+/messages",
            r"/v1/threads/.+/runs",
            r"/v1/audio/transcriptions",
            r"/v1/audio/translations",
            r"/v1/audio/speech",
            r"/v1/images/generations",
            r"/v1/images/edits",
            r"/v1/images/variations",
            r"/v1/moderations",
            r"/v1/files",
            r"/v1/batches",
            r"/chat/completions$",
            r"/completions$",
            r"/embeddings$",
        ],
        hosts: &[r"api\.openai\.com", r"localhost", r"127\.0\.0\.1", r".*"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "ollama",
        paths: &[
            r"/api/generate",
            r"/api/chat",
            r"/api/embeddings",
            r"/v1/chat/completions",
        ],
        hosts: &[r"localhost", r"127\.0\.0\.1", r".*:11434"],
        shape: ResponseShape::Auto,
    },
    Builtin {
        name: "google_adk",
        paths: &[r"/run$", r"/run_sse$", r"/api/run$", r"/api/run_sse$"],
        hosts: &[r"localhost", r"127\.0\.0\.1"],
        shape: ResponseShape::Auto,
    },
];

/// The built-in signature table, in match order
pub fn builtin_specs() -> Vec<SignatureSpec> {
    BUILTINS
        .iter()
        .map(|builtin| SignatureSpec {
            name: builtin.name.to_string(),
            path_patterns: builtin.paths.iter().map(|p| (*p).to_string()).collect(),
            host_patterns: builtin.hosts.iter().map(|h| (*h).to_string()).collect(),
            is_regex: true,
            response_shape: builtin.shape,
        })
        .collect()
}
