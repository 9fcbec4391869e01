//! End-to-end runs against real node processes (`forkvisor-node`).

use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use forkvisor::node::Node;
use forkvisor::process::is_alive;
use forkvisor::{Config, NodeState, RuntimeError, Supervisor, SupervisorBuilder, Transport, TreeBuilder};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

const NODE_BIN: &str = env!("CARGO_BIN_EXE_forkvisor-node");

struct Running {
    sup: Arc<Supervisor>,
    stop: oneshot::Sender<()>,
    runner: JoinHandle<Result<(), RuntimeError>>,
    socket: std::path::PathBuf,
}

impl Running {
    fn node(&self, name: &str) -> &Arc<Node> {
        self.sup.tree().node(name).unwrap()
    }

    async fn shutdown(self) -> Arc<Supervisor> {
        self.stop.send(()).unwrap();
        time::timeout(Duration::from_secs(20), self.runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.sup
    }
}

fn start(dir: &Path, root_argv: Vec<String>, tree: impl FnOnce(TreeBuilder) -> TreeBuilder) -> Running {
    let socket = dir.join("fv.sock");
    let cfg = Config {
        socket_path: socket.clone(),
        debounce: Duration::from_millis(50),
        grace: Duration::from_secs(10),
        ..Config::default()
    };
    let sup = Arc::new(
        SupervisorBuilder::new(cfg)
            .with_event_log()
            .build(tree(TreeBuilder::new("boot", root_argv)))
            .unwrap(),
    );
    let (stop, stop_rx) = oneshot::channel::<()>();
    let runner = {
        let sup = sup.clone();
        tokio::spawn(async move {
            sup.run_until(async {
                let _ = stop_rx.await;
            })
            .await
        })
    };
    Running {
        sup,
        stop,
        runner,
        socket,
    }
}

fn node_argv(plan: &Value) -> Vec<String> {
    vec![NODE_BIN.to_string(), plan.to_string()]
}

async fn wait_for(node: &Node, state: NodeState) {
    let reached = time::timeout(Duration::from_secs(10), async {
        while node.state() != state {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{} never reached {state}: {:?}", node.name(), node.status());
}

/// Runs one client handshake; returns (pid frame, exit frame, terminal output).
async fn run_client(socket: &Path, command: &str, args: &[&str]) -> (String, String, String) {
    let tty = tempfile::NamedTempFile::new().unwrap();
    let stream = tokio::net::UnixStream::connect(socket).await.unwrap();
    let client = Transport::from_unix_stream(stream).unwrap();

    client
        .write_message(&format!("T:{}:{}:{command}", args.len(), std::process::id()))
        .await
        .unwrap();
    for arg in args {
        client.write_message(arg).await.unwrap();
    }
    client.write_fd(tty.as_file().as_fd()).await.unwrap();

    let pid = time::timeout(Duration::from_secs(10), client.read_message())
        .await
        .unwrap()
        .unwrap();
    let exit = time::timeout(Duration::from_secs(10), client.read_message())
        .await
        .unwrap()
        .unwrap();
    let output = std::fs::read_to_string(tty.path()).unwrap();
    (pid, exit, output)
}

#[tokio::test(flavor = "multi_thread")]
async fn forks_tree_and_runs_commands_on_client_terminals() {
    let dir = tempfile::tempdir().unwrap();
    let plan = json!({
        "actions": {
            "boot": {},
            "code": {},
            "data": {},
        },
        "commands": {
            "rake": { "output": "migrating\n", "echo_args": true, "exit": 3 },
        },
    });
    let running = start(dir.path(), node_argv(&plan), |t| {
        t.with_node("code", "boot")
            .with_node("data", "boot")
            .with_command("rake", "code", ["r"])
    });
    for name in ["boot", "code", "data"] {
        wait_for(running.node(name), NodeState::Ready).await;
    }

    let boot_pid = running.node("boot").status().pid.unwrap();
    let code_pid = running.node("code").status().pid.unwrap();
    assert_ne!(boot_pid, code_pid);

    let (pid, exit, output) = run_client(&running.socket, "r", &["db:migrate", "VERBOSE=1"]).await;
    assert!(pid.parse::<i32>().unwrap() > 0);
    assert_eq!(exit, "3");
    assert_eq!(output, "migrating\ndb:migrate VERBOSE=1\n");

    let sup = running.shutdown().await;
    for node in sup.tree().nodes() {
        assert_eq!(node.state(), NodeState::Stopped);
    }
    assert!(!is_alive(boot_pid));
    assert!(!dir.path().join("fv.sock").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_dependency_restarts_only_the_owning_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let code_rb = dir.path().join("code.rb");
    std::fs::write(&code_rb, "v1").unwrap();
    let code_path = code_rb.to_string_lossy().into_owned();

    let plan = json!({
        "actions": {
            "boot": {},
            "code": { "features": [code_path] },
            "test": {},
            "data": {},
        },
        "commands": { "seed": { "output": "seeded\n" } },
    });
    let running = start(dir.path(), node_argv(&plan), |t| {
        t.with_node("code", "boot")
            .with_node("test", "code")
            .with_node("data", "boot")
            .with_command("seed", "data", Vec::<String>::new())
    });
    for name in ["boot", "code", "test", "data"] {
        wait_for(running.node(name), NodeState::Ready).await;
    }
    let before: Vec<i32> = ["boot", "code", "test", "data"]
        .iter()
        .map(|n| running.node(n).status().pid.unwrap())
        .collect();

    time::timeout(Duration::from_secs(10), async {
        while !running.node("code").has_feature(&code_path) {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    time::sleep(Duration::from_millis(200)).await;
    std::fs::write(&code_rb, "v2").unwrap();

    let (pid, exit, output) = run_client(&running.socket, "seed", &[]).await;
    assert!(pid.parse::<i32>().unwrap() > 0);
    assert_eq!((exit.as_str(), output.as_str()), ("0", "seeded\n"));

    time::timeout(Duration::from_secs(15), async {
        loop {
            let code = running.node("code").status();
            let test = running.node("test").status();
            if code.state == NodeState::Ready
                && test.state == NodeState::Ready
                && code.pid != Some(before[1])
                && test.pid != Some(before[2])
            {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(running.node("boot").status().pid, Some(before[0]));
    assert_eq!(running.node("data").status().pid, Some(before[3]));
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_action_crashes_subtree_and_fails_clients() {
    let dir = tempfile::tempdir().unwrap();
    let plan = json!({
        "actions": {
            "boot": {},
            "code": { "fail": "cannot load such file -- missing (LoadError)" },
            "data": {},
        },
        "commands": { "rspec": {} },
    });
    let running = start(dir.path(), node_argv(&plan), |t| {
        t.with_node("code", "boot")
            .with_node("test", "code")
            .with_node("data", "boot")
            .with_command("rspec", "test", Vec::<String>::new())
    });
    wait_for(running.node("data"), NodeState::Ready).await;
    wait_for(running.node("code"), NodeState::Crashed).await;
    wait_for(running.node("test"), NodeState::Crashed).await;
    let error = running.node("code").status().error.unwrap();
    assert!(error.contains("LoadError"), "{error}");

    let (pid, exit, output) = run_client(&running.socket, "rspec", &[]).await;
    assert_eq!(pid, "0");
    assert_eq!(exit, "1");
    assert!(output.contains("LoadError"), "{output}");

    let (pid, exit, output) = run_client(&running.socket, "deploy", &[]).await;
    assert_eq!((pid.as_str(), exit.as_str()), ("0", "1"));
    assert!(output.contains("unknown command"), "{output}");

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn root_exit_is_reported_with_its_output() {
    let dir = tempfile::tempdir().unwrap();
    let argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo 'config/boot.rb:3: syntax error' >&2; exit 3".to_string(),
    ];
    let running = start(dir.path(), argv, |t| t.with_node("code", "boot"));
    wait_for(running.node("boot"), NodeState::Crashed).await;
    wait_for(running.node("code"), NodeState::Crashed).await;

    let error = running.node("boot").status().error.unwrap();
    assert!(error.contains("syntax error"), "{error}");
    assert!(error.contains('3'), "{error}");
    running.shutdown().await;
}
