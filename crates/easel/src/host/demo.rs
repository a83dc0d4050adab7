//! Built-in commands for exercising a bridge without a real editor behind it.

use serde::Deserialize;
use serde_json::json;

use super::dispatch::{CommandOutput, CommandTable, HandlerError};
use crate::version::EASEL_VERSION;

#[derive(Debug, Deserialize)]
struct EchoParams {
    message: String,
}

/// `echo {message}` -> `{echo: message}`; `ping` -> `{pong: true, version}`.
pub fn demo_commands() -> CommandTable {
    let mut table = CommandTable::new();
    table
        .register_fn("echo", |params| async move {
            let params: EchoParams = serde_json::from_value(params)?;
            Ok::<_, HandlerError>(CommandOutput::unchanged(json!({"echo": params.message})))
        })
        .register_fn("ping", |_| async {
            Ok(CommandOutput::unchanged(
                json!({"pong": true, "version": EASEL_VERSION}),
            ))
        });
    table
}
