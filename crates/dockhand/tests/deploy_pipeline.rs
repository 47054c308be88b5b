mod support;

use std::fs;
use std::sync::Arc;

use dockhand::config::ConfigDoc;
use dockhand::error::ErrorKind;
use dockhand::input::NoInputPrompter;

use support::{
    FakeRunner, Fixture, TOKEN, TokenOnly, exit, fake_clone, is_git, is_probe, ok,
    script_contains,
};

#[test]
fn plan_runs_stages_in_pipeline_order() {
    let plan = dockhand::modules::build_plan(&ConfigDoc::empty()).expect("plan");
    let ids: Vec<&str> = plan
        .ordered()
        .expect("order")
        .iter()
        .map(|t| t.id.as_str())
        .collect();
    assert_eq!(
        ids,
        vec![
            "core.collect",
            "repo.fetch",
            "repo.verify",
            "host.probe",
            "host.provision",
            "sync.files",
            "container.deploy",
            "proxy.configure",
            "validate.reachability",
        ]
    );
}

#[test]
fn happy_path_clones_deploys_and_keeps_token_out_of_the_log() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
            // git echoes the remote it talked to
            return dockhand::executor::runner::CmdOutput {
                code: Some(0),
                lines: vec![format!("Cloning from {}", spec.args[1])],
            };
        }
        ok()
    });

    let (res, log) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    res.expect("pipeline succeeds");

    assert!(!log.contains(TOKEN), "token leaked into run log:\n{log}");
    assert!(log.contains("https://***@github.com/acme/web-app.git"));

    let calls = runner.calls();
    let clone = calls.iter().find(|c| is_git(c, "clone")).expect("clone");
    assert_eq!(
        clone.args[1],
        format!("https://{TOKEN}@github.com/acme/web-app.git")
    );
    let set_url = calls
        .iter()
        .find(|c| is_git(c, "remote"))
        .expect("remote set-url");
    assert_eq!(
        set_url.args,
        vec!["remote", "set-url", "origin", support::REPO_URL]
    );

    let rsync = calls.iter().find(|c| c.program == "rsync").expect("rsync");
    assert!(!rsync.args.iter().any(|a| a.starts_with("--delete")));
    assert!(rsync.args.contains(&"deploy@203.0.113.10:web-app/".to_string()));

    // Every stage wrote its marker lines into the run log.
    assert!(log.contains("[INFO] ==> Provision host (host.provision)"));
    assert!(log.contains("deployment finished"));
}

#[test]
fn deploy_session_stops_old_container_best_effort() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        ok()
    });
    let (res, _) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    res.expect("pipeline succeeds");

    let deploy = runner
        .ssh_calls()
        .into_iter()
        .find(|c| script_contains(c, "docker run"))
        .expect("deploy session");
    let script = deploy.stdin.unwrap_or_default();
    assert!(script.contains(
        "if { docker stop web-app\n}; then echo '==> ok: stop previous container'; else echo '==> ignored failure: stop previous container'; fi"
    ));
    assert!(script.contains("if { docker rm web-app\n}"));
    assert!(script.contains("--restart unless-stopped -p 3000:3000 web-app"));
}

#[test]
fn proxy_session_tests_config_before_reload() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        ok()
    });
    let (res, _) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    res.expect("pipeline succeeds");

    let proxy = runner
        .ssh_calls()
        .into_iter()
        .find(|c| script_contains(c, "nginx -t"))
        .expect("proxy session");
    let script = proxy.stdin.unwrap_or_default();
    let test = script.find("sudo nginx -t").expect("test");
    let reload = script.find("sudo systemctl reload nginx").expect("reload");
    assert!(test < reload);
    assert!(script.starts_with("set -euo pipefail"));
}

#[test]
fn missing_descriptor_fails_before_any_remote_session() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["README.md"]);
        }
        ok()
    });

    let (res, log) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("stage 'repo.verify'"));
    assert!(runner.ssh_calls().is_empty());
    assert!(!runner.calls().iter().any(|c| c.program == "rsync"));
    assert!(log.contains("[ERROR] repo.verify failed"));
}

#[test]
fn unreachable_host_halts_the_run() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        if is_probe(spec) { exit(255) } else { ok() }
    });

    let (res, log) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.to_string().contains("check network and credentials"));
    assert_eq!(runner.ssh_calls().len(), 1, "nothing may run after the probe");
    assert!(log.contains("deployment aborted"));
}

#[test]
fn existing_working_copy_is_fast_forwarded_not_recloned() {
    let fx = Fixture::new();
    let wc = fx.working_copy();
    fs::create_dir_all(wc.join(".git")).expect("mkdir .git");
    fs::write(wc.join("compose.yaml"), "services: {}\n").expect("write compose");

    let runner = FakeRunner::new(|_| ok());
    let (res, log) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    res.expect("pipeline succeeds");

    let git: Vec<Vec<String>> = runner
        .calls()
        .into_iter()
        .filter(|c| c.program == "git")
        .map(|c| c.args)
        .collect();
    assert_eq!(git.len(), 3, "{git:?}");
    assert_eq!(git[0][0], "fetch");
    assert_eq!(git[0][2], "+refs/heads/main:refs/remotes/origin/main");
    assert_eq!(git[1], vec!["checkout", "main"]);
    assert_eq!(git[2], vec!["merge", "--ff-only", "origin/main"]);
    assert!(log.contains("build descriptor: compose.yaml (compose)"));

    let deploy = runner
        .ssh_calls()
        .into_iter()
        .find(|c| script_contains(c, "up -d --build"))
        .expect("compose deploy session");
    assert!(deploy.stdin.unwrap_or_default().contains("-p web-app down"));
}

#[test]
fn diverged_working_copy_stops_before_the_host_is_touched() {
    let fx = Fixture::new();
    let wc = fx.working_copy();
    fs::create_dir_all(wc.join(".git")).expect("mkdir .git");
    fs::write(wc.join("Dockerfile"), "FROM scratch\n").expect("write Dockerfile");

    let runner = FakeRunner::new(|spec| if is_git(spec, "merge") { exit(128) } else { ok() });
    let (res, _) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("has diverged from origin/main"), "{err}");
    assert!(runner.ssh_calls().is_empty());
}

#[test]
fn external_check_failure_is_only_a_warning() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        ok()
    });

    let (res, log) = fx.run(&fx.doc(), runner, Arc::new(TokenOnly));
    res.expect("advisory check must not fail the run");
    assert!(
        log.lines()
            .any(|l| l.contains("[WARN] http://127.0.0.1:9/ is not reachable")),
        "{log}"
    );
    assert!(log.contains("container:        web-app"));
}

#[test]
fn failed_container_is_a_deployment_error_and_skips_proxy() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        if script_contains(spec, "docker run") {
            exit(1)
        } else {
            ok()
        }
    });

    let (res, log) = fx.run(&fx.doc(), runner.clone(), Arc::new(TokenOnly));
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deployment);
    assert!(log.contains("[ERROR] container web-app did not come up"), "{log}");
    assert!(
        !runner
            .ssh_calls()
            .iter()
            .any(|c| script_contains(c, "nginx -t"))
    );
}

#[test]
fn ssh_failure_during_provisioning_is_a_transport_error() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        if script_contains(spec, "apt-get update") {
            exit(255)
        } else {
            ok()
        }
    });
    let (res, _) = fx.run(&fx.doc(), runner, Arc::new(TokenOnly));
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Transport);
}

#[test]
fn provisioning_failure_keeps_its_class() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|spec| {
        if is_git(spec, "clone") {
            fake_clone(spec, &["Dockerfile"]);
        }
        if script_contains(spec, "apt-get update") {
            exit(100)
        } else {
            ok()
        }
    });
    let (res, _) = fx.run(&fx.doc(), runner, Arc::new(TokenOnly));
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Provisioning);
}

#[test]
fn missing_inputs_without_prompts_run_nothing() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|_| ok());
    let (res, _) = fx.run(&ConfigDoc::empty(), runner.clone(), Arc::new(NoInputPrompter));
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(runner.calls().is_empty());
}
