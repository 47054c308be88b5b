use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod container;
pub mod core;
pub mod host;
pub mod proxy;
pub mod repo;
pub mod sync;
pub mod util;
pub mod validate;

pub trait Module {
    fn id(&self) -> &'static str;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

/// Pipeline order is decided by the planner, not by this list.
pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(repo::RepoModule),
        Box::new(host::HostModule),
        Box::new(sync::SyncModule),
        Box::new(container::ContainerModule),
        Box::new(proxy::ProxyModule),
        Box::new(validate::ValidateModule),
    ]
}

/// Plan every built-in module against `doc`.
pub fn build_plan(doc: &ConfigDoc) -> Result<Plan> {
    core::check_tables(doc)?;
    let mut plan = Plan::default();
    for m in builtin_modules() {
        tracing::debug!(module = m.id(), "planning");
        m.plan(doc, &mut plan)?;
    }
    Ok(plan)
}
