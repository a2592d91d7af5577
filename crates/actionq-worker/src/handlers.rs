use actionq_core::ActionArgs;
use actionq_hooks::{error::Result, HandlerError, HookRegistry};
use tracing::info;

/// Writes its arguments to the log. Handy for checking a deployment end to end.
pub const LOG_HOOK: &str = "actionq.log";

/// Always fails; lets operators watch retry and suppression behaviour.
pub const FAIL_HOOK: &str = "actionq.fail";

/// Register the handlers every worker process carries.
pub fn register_builtin(registry: &HookRegistry) {
    registry.on(LOG_HOOK, |args: &ActionArgs| -> Result<()> {
        let rendered = args.to_json()?;
        info!(hook = LOG_HOOK, args = %rendered, "log action ran");
        Ok(())
    });
    registry.on(FAIL_HOOK, |args: &ActionArgs| -> Result<()> {
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("requested failure");
        Err(HandlerError::failed(reason))
    });
}
