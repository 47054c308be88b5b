use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::util::{self, default_true};
use crate::remote::{self, RemoteScript, RemoteStep, shell_quote};
use crate::{Error, Result};

const SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
const SITES_ENABLED: &str = "/etc/nginx/sites-enabled";
const HEREDOC_END: &str = "DOCKHAND_SITE";

#[Task(
    id = "proxy.configure",
    module = "proxy",
    phase = "configure",
    provides = ["remote:proxy"],
    after = ["container.deploy"],
    failure = Configuration,
    default_label = "Configure reverse proxy"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigureTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub server_name: String,
    pub listen_port: u16,
}

impl Default for ConfigureTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            server_name: "_".into(),
            listen_port: 80,
        }
    }
}

impl ConfigureTask {
    pub fn run(cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let (params, target) = util::ssh_target(ctx)?;
        let site = params.container_name()?;
        let script = proxy_script(cfg, &site, params.app_port)?;
        ctx.log(&format!(
            "nginx site {site}: port {} -> 127.0.0.1:{}",
            cfg.listen_port, params.app_port
        ));
        remote::run_script(ctx, &target, &script)?;
        ctx.log("nginx reloaded");
        Ok(())
    }
}

/// One `server` block forwarding everything to the application port.
pub fn render_site_config(server_name: &str, listen_port: u16, app_port: u16) -> String {
    format!(
        "server {{
    listen {listen_port};
    server_name {server_name};

    location / {{
        proxy_pass http://127.0.0.1:{app_port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
    }}
}}
"
    )
}

pub fn proxy_script(cfg: &ConfigureTask, site: &str, app_port: u16) -> Result<RemoteScript> {
    let server_name = cfg.server_name.trim();
    if server_name.is_empty() || server_name.contains([';', '{', '}', '\n']) {
        return Err(Error::msg(format!(
            "[proxy.steps.configure].server_name '{server_name}' is not a valid nginx server_name"
        )));
    }
    let body = render_site_config(server_name, cfg.listen_port, app_port);
    if body.lines().any(|l| l == HEREDOC_END) {
        return Err(Error::msg("site config collides with the heredoc terminator"));
    }
    let available = shell_quote(&format!("{SITES_AVAILABLE}/{site}"));
    let enabled = shell_quote(&format!("{SITES_ENABLED}/{site}"));

    Ok(RemoteScript::new("proxy")
        .step(RemoteStep::required(
            "write site config",
            format!("sudo tee {available} >/dev/null <<'{HEREDOC_END}'\n{body}{HEREDOC_END}"),
        ))
        .step(RemoteStep::required(
            "enable site",
            format!("sudo ln -sf {available} {enabled}"),
        ))
        .step(RemoteStep::required(
            "disable default site",
            format!("sudo rm -f {SITES_ENABLED}/default"),
        ))
        .step(RemoteStep::required("test nginx config", "sudo nginx -t"))
        .step(RemoteStep::required(
            "reload nginx",
            "sudo systemctl reload nginx",
        )))
}

#[Module(id = "proxy", tasks = [ConfigureTask])]
pub struct ProxyModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_config_forwards_with_upgrade_headers() {
        let text = render_site_config("_", 80, 3000);
        assert!(text.contains("listen 80;"));
        assert!(text.contains("server_name _;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:3000;"));
        for header in [
            "Upgrade",
            "Connection",
            "Host",
            "X-Real-IP",
            "X-Forwarded-For",
            "X-Forwarded-Proto",
        ] {
            assert!(
                text.contains(&format!("proxy_set_header {header} ")),
                "missing {header}"
            );
        }
        assert_eq!(text.matches("server {").count(), 1);
    }

    #[test]
    fn config_is_tested_before_reload() {
        let script = proxy_script(&ConfigureTask::default(), "web-app", 3000).expect("script");
        let text = script.render();
        let test = text.find("sudo nginx -t").expect("nginx -t");
        let reload = text.find("sudo systemctl reload nginx").expect("reload");
        assert!(test < reload);
        assert!(text.contains("sudo ln -sf /etc/nginx/sites-available/web-app /etc/nginx/sites-enabled/web-app"));
        assert!(text.contains("sudo rm -f /etc/nginx/sites-enabled/default"));
        assert!(text.contains("<<'DOCKHAND_SITE'\nserver {"));
    }

    #[test]
    fn server_name_cannot_inject_directives() {
        let cfg = ConfigureTask {
            server_name: "a; include /etc/passwd".into(),
            ..ConfigureTask::default()
        };
        assert!(proxy_script(&cfg, "web-app", 3000).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejected_config_is_never_reloaded() {
        let stubs = "sudo() { case \"$1\" in nginx) return 1;; systemctl) echo MARK_RELOADED;; esac; }";
        let script = proxy_script(&ConfigureTask::default(), "web-app", 3000).expect("script");
        let (code, out) = crate::remote::run_locally(stubs, &script);
        assert_ne!(code, Some(0));
        assert!(out.contains("==> [4/5] test nginx config"));
        assert!(!out.contains("MARK_RELOADED"), "{out}");

        let stubs = "sudo() { case \"$1\" in systemctl) echo MARK_RELOADED;; esac; }";
        let (code, out) = crate::remote::run_locally(stubs, &script);
        assert_eq!(code, Some(0), "{out}");
        assert!(out.contains("MARK_RELOADED"));
    }
}
