use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

const OPERATOR_NAMESPACE: &str = "mariadb-failover-system";
const TEST_NAMESPACE: &str = "mariadb-e2e";
const OPERATOR_NAME: &str = "mariadb-failover-operator";
const CLUSTER_NAME: &str = "db";

/// End-to-end failover on a real Kind cluster.
///
/// 1. Start (or reuse) a Kind cluster and install the CRD printed by `crdgen`.
/// 2. Deploy the operator and a three-pod MariaDB StatefulSet.
/// 3. Wait for the operator to adopt pod 0 as primary.
/// 4. Request a planned switchover to pod 1 and wait for it to commit.
/// 5. Scale the primary away and wait for an automatic failover to pod 0.
///
/// Run with: cargo test --test e2e_kind -- --ignored
#[test]
#[ignore]
fn e2e_planned_and_unplanned_failover() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let kind_cluster =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "mariadb-e2e".into());
    ensure_kind_cluster(&kind_cluster)?;

    let crd = run_cmd(env!("CARGO_BIN_EXE_crdgen"), &[])?;
    kubectl_apply(&crd)?;

    let image = std::env::var("E2E_OPERATOR_IMAGE")
        .unwrap_or_else(|_| "mariadb-failover-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", true) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &kind_cluster],
        )?;
    }

    let operator_yaml = operator_manifest(&image);
    let _cleanup = Cleanup {
        operator_manifest: operator_yaml.clone(),
    };

    ensure_namespace(OPERATOR_NAMESPACE)?;
    ensure_namespace(TEST_NAMESPACE)?;

    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("deployment/{}", OPERATOR_NAME),
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    kubectl_apply(&database_manifest())?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("statefulset/{}", CLUSTER_NAME),
            "-n",
            TEST_NAMESPACE,
            "--timeout=300s",
        ],
    )?;
    kubectl_apply(&cluster_manifest())?;

    wait_for("pod 0 adopted as primary", Duration::from_secs(120), || {
        Ok(status_field("{.status.currentPrimaryIndex}") == "0")
    })?;

    run_cmd(
        "kubectl",
        &[
            "patch",
            "mariadbcluster",
            CLUSTER_NAME,
            "-n",
            TEST_NAMESPACE,
            "--type",
            "merge",
            "-p",
            r#"{"spec":{"replication":{"primary":{"podIndex":1}}}}"#,
        ],
    )?;

    wait_for("planned switchover to pod 1", Duration::from_secs(180), || {
        Ok(status_field("{.status.currentPrimaryIndex}") == "1"
            && status_field("{.status.conditions[?(@.type=='Ready')].status}") == "True")
    })?;

    let labelled = run_cmd(
        "kubectl",
        &[
            "get",
            "pods",
            "-n",
            TEST_NAMESPACE,
            "-l",
            "mariadb.failover.dev/role=primary",
            "-o",
            "jsonpath={.items[*].metadata.name}",
        ],
    )?;
    if labelled != format!("{}-1", CLUSTER_NAME) {
        return Err(format!("primary label on unexpected pods: {:?}", labelled).into());
    }

    // pods 1 and 2 go away, leaving pod 0 as the only candidate
    run_cmd(
        "kubectl",
        &[
            "scale",
            "statefulset",
            CLUSTER_NAME,
            "-n",
            TEST_NAMESPACE,
            "--replicas=1",
        ],
    )?;

    wait_for("automatic failover to pod 0", Duration::from_secs(300), || {
        Ok(status_field("{.status.currentPrimaryIndex}") == "0")
    })?;

    Ok(())
}

fn status_field(jsonpath: &str) -> String {
    run_cmd(
        "kubectl",
        &[
            "get",
            "mariadbcluster",
            CLUSTER_NAME,
            "-n",
            TEST_NAMESPACE,
            "-o",
            &format!("jsonpath={}", jsonpath),
        ],
    )
    .unwrap_or_default()
}

struct Cleanup {
    operator_manifest: String,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = run_cmd(
            "kubectl",
            &[
                "delete",
                "namespace",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
                "--timeout=120s",
            ],
        );
        let _ = run_cmd_with_stdin("kubectl", &["delete", "-f", "-"], &self.operator_manifest);
        let _ = run_cmd(
            "kubectl",
            &[
                "delete",
                "namespace",
                OPERATOR_NAMESPACE,
                "--ignore-not-found=true",
            ],
        );
    }
}

fn ensure_namespace(name: &str) -> Result<(), Box<dyn Error>> {
    let manifest = run_cmd(
        "kubectl",
        &["create", "namespace", name, "--dry-run=client", "-o", "yaml"],
    )?;
    kubectl_apply(&manifest)
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn database_manifest() -> String {
    format!(
        r#"---
apiVersion: v1
kind: Secret
metadata:
  name: {name}-credentials
  namespace: {namespace}
stringData:
  username: root
  password: e2e-root-password
---
apiVersion: v1
kind: Service
metadata:
  name: {name}-internal
  namespace: {namespace}
spec:
  clusterIP: None
  publishNotReadyAddresses: true
  selector:
    app.kubernetes.io/instance: {name}
  ports:
    - name: mysql
      port: 3306
---
apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: {name}
  namespace: {namespace}
spec:
  serviceName: {name}-internal
  replicas: 3
  podManagementPolicy: Parallel
  selector:
    matchLabels:
      app.kubernetes.io/instance: {name}
  template:
    metadata:
      labels:
        app.kubernetes.io/instance: {name}
    spec:
      containers:
        - name: mariadb
          image: mariadb:11.4
          command: ["/bin/bash", "-c"]
          args:
            - exec docker-entrypoint.sh mariadbd --server-id=$((${{HOSTNAME##*-}}+10)) --log-bin --log-slave-updates --gtid-strict-mode=ON
          env:
            - name: MARIADB_ROOT_PASSWORD
              valueFrom:
                secretKeyRef:
                  name: {name}-credentials
                  key: password
          ports:
            - containerPort: 3306
          readinessProbe:
            tcpSocket:
              port: 3306
            periodSeconds: 5
"#,
        name = CLUSTER_NAME,
        namespace = TEST_NAMESPACE
    )
}

fn cluster_manifest() -> String {
    format!(
        r#"---
apiVersion: mariadb.failover.dev/v1alpha1
kind: MariaDbCluster
metadata:
  name: {name}
  namespace: {namespace}
spec:
  replicas: 3
  credentials:
    name: {name}-credentials
  replication:
    primary:
      podIndex: 0
      automaticFailover: true
      automaticFailoverDelaySeconds: 5
    syncTimeoutSeconds: 30
"#,
        name = CLUSTER_NAME,
        namespace = TEST_NAMESPACE
    )
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {operator_name}
  namespace: {operator_namespace}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {operator_name}
rules:
  - apiGroups: ["mariadb.failover.dev"]
    resources: ["mariadbclusters"]
    verbs: ["get", "list", "watch", "update", "patch"]
  - apiGroups: ["mariadb.failover.dev"]
    resources: ["mariadbclusters/status"]
    verbs: ["get", "update", "patch"]
  - apiGroups: [""]
    resources: ["pods"]
    verbs: ["get", "list", "watch", "patch"]
  - apiGroups: [""]
    resources: ["services"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["get"]
  - apiGroups: ["apps"]
    resources: ["deployments", "statefulsets"]
    verbs: ["get", "list", "watch", "patch"]
  - apiGroups: [""]
    resources: ["events"]
    verbs: ["create", "patch"]
  - apiGroups: ["events.k8s.io"]
    resources: ["events"]
    verbs: ["create", "patch"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "create", "update", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {operator_name}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {operator_name}
subjects:
  - kind: ServiceAccount
    name: {operator_name}
    namespace: {operator_namespace}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {operator_name}
  namespace: {operator_namespace}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {operator_name}
  template:
    metadata:
      labels:
        app: {operator_name}
    spec:
      serviceAccountName: {operator_name}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run"]
          env:
            - name: OPERATOR_NAMESPACE
              value: {operator_namespace}
            - name: POD_NAMESPACE
              valueFrom:
                fieldRef:
                  fieldPath: metadata.namespace
"#,
        operator_name = OPERATOR_NAME,
        operator_namespace = OPERATOR_NAMESPACE,
        image = image
    )
}
