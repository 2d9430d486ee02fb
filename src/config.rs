use std::path::PathBuf;

use clap::Parser;

use crate::model::InputShape;

/// Runtime configuration. Every flag can also be set through its environment
/// variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "diagnosis_service_rs", version, about = "Chest X-ray diagnosis service")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 5020)]
    pub port: u16,

    /// Maximum upload size in megabytes.
    #[arg(long, env = "BODY_LIMIT_MB", default_value_t = 5)]
    pub body_limit_mb: usize,

    #[arg(long, env = "MODEL_PATH", default_value = "./model/frozen_graph.pb")]
    pub model_path: PathBuf,

    /// Fetched into `model_path` at startup when the file is missing.
    #[arg(long, env = "MODEL_URL")]
    pub model_url: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[arg(long, env = "MODEL_INPUT_HEIGHT", default_value_t = 240)]
    pub input_height: u32,

    #[arg(long, env = "MODEL_INPUT_WIDTH", default_value_t = 240)]
    pub input_width: u32,

    #[arg(long, env = "MODEL_INPUT_OP", default_value = "x")]
    pub input_op: String,

    #[arg(long, env = "MODEL_OUTPUT_OP", default_value = "Identity")]
    pub output_op: String,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://diagnosis.db?mode=rwc")]
    pub database_url: String,

    /// Shared secret for signing and verifying HS256 tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4")]
    pub openai_model: String,
}

impl Config {
    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }

    pub fn input_shape(&self) -> InputShape {
        InputShape {
            height: self.input_height,
            width: self.input_width,
        }
    }
}
