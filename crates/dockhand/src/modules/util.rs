use std::sync::Arc;

use crate::error::Result;
use crate::executor::ExecCtx;
use crate::params::RunParameters;
use crate::remote::SshTarget;

pub fn default_true() -> bool {
    true
}

/// Collected parameters plus the SSH target they describe.
pub fn ssh_target(ctx: &ExecCtx) -> Result<(Arc<RunParameters>, SshTarget)> {
    let params = ctx.params()?;
    let target = SshTarget::from_params(&params);
    Ok((params, target))
}

pub fn non_blank(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}
