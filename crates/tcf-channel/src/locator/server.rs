//! Minimal local `Locator` service answering the remote end's queries.

use serde_json::Value;

use super::{GET_PEERS_COMMAND, REDIRECT_COMMAND, SYNC_COMMAND};
use crate::errors::{ErrorReport, error_codes};
use crate::service::{CommandContext, CommandServer, ServiceError};
use crate::token::Token;

/// Built-in server registered on every channel that does not bring its own.
///
/// The local end announces no peers and cannot splice channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocatorServer;

impl CommandServer for LocatorServer {
    fn command(
        &self,
        context: &mut CommandContext<'_>,
        _token: &Token,
        name: &str,
        _data: &[u8],
    ) -> Result<(), ServiceError> {
        match name {
            SYNC_COMMAND => context.send_result(None)?,
            GET_PEERS_COMMAND => {
                context.send_result(Some([Value::Null, Value::Array(Vec::new())].as_slice()))?;
            }
            REDIRECT_COMMAND => {
                let report = ErrorReport::new(error_codes::UNSUPPORTED, "Redirect is not supported")
                    .with_service(super::LOCATOR_SERVICE);
                context.send_result(Some([report.to_value()].as_slice()))?;
            }
            _ => context.reject(),
        }
        Ok(())
    }
}
