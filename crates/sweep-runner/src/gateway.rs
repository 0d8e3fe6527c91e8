use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::command::{CommandError, CommandLine};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProbeError::Body(err.to_string())
        } else if let Some(status) = err.status() {
            ProbeError::Status(status.as_u16())
        } else {
            ProbeError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadMode {
    Erasure {
        alpha: u32,
        s: u32,
        p: u32,
        replication: u32,
    },
    DirectReplication(u32),
}

impl UploadMode {
    fn cli_args(&self) -> Vec<String> {
        match self {
            UploadMode::Erasure {
                alpha,
                s,
                p,
                replication,
            } => vec![
                "--alpha".to_string(),
                alpha.to_string(),
                "-s".to_string(),
                s.to_string(),
                "-p".to_string(),
                p.to_string(),
                "-r".to_string(),
                replication.to_string(),
            ],
            UploadMode::DirectReplication(factor) => vec!["-t".to_string(), factor.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    Count(u64),
    Metrics(Value),
}

impl Recovery {
    pub fn into_value(self) -> Value {
        match self {
            Recovery::Count(n) => Value::from(n),
            Recovery::Metrics(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollabRepairRequest {
    #[serde(rename = "fileCID")]
    pub file_cid: String,
    #[serde(rename = "metaCID")]
    pub meta_cid: String,
    pub depth: u32,
    pub origin: String,
    #[serde(rename = "numPeers")]
    pub num_peers: u32,
}

pub trait OperationGateway {
    fn upload(&self, payload: &Path, mode: &UploadMode) -> Result<(), CommandError>;

    fn pin_status(&self, meta_cid: &str) -> Result<bool, ProbeError>;

    fn download_count(
        &self,
        file_cid: &str,
        meta_cid: Option<&str>,
        depth: u32,
        with_metrics: bool,
    ) -> Result<Recovery, CommandError>;

    fn trigger_collab_repair(&self, request: &CollabRepairRequest) -> Result<(), ProbeError>;

    fn repair_done(&self) -> Result<bool, ProbeError>;

    fn fetch_metrics(&self) -> Result<Value, ProbeError>;

    fn count_active_peers(&self) -> Result<usize, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct GatewayEndpoints {
    pub control_api: String,
    pub repair_api: String,
    pub cluster_api: String,
    pub request_timeout: Duration,
}

pub struct CliGateway {
    cli: CommandLine,
    scratch_dir: PathBuf,
    endpoints: GatewayEndpoints,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct PinStatus {
    #[serde(default)]
    peer_map: std::collections::BTreeMap<String, PeerPin>,
}

#[derive(Debug, Deserialize)]
struct PeerPin {
    #[serde(default)]
    status: String,
}

impl CliGateway {
    pub fn new(
        cli: CommandLine,
        scratch_dir: impl Into<PathBuf>,
        endpoints: GatewayEndpoints,
    ) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(endpoints.request_timeout)
            .build()?;
        Ok(Self {
            cli,
            scratch_dir: scratch_dir.into(),
            endpoints,
            http,
        })
    }

    pub fn download(
        &self,
        file_cid: &str,
        meta_cid: &str,
        depth: u32,
        address: &str,
    ) -> Result<(), CommandError> {
        self.cli.run(download_args(file_cid, meta_cid, depth, address))?;
        Ok(())
    }

    fn get_json(&self, url: &str) -> Result<Value, ProbeError> {
        let response = self.http.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        response
            .json::<Value>()
            .map_err(|e| ProbeError::Body(e.to_string()))
    }

    fn scratch_output_path(&self) -> PathBuf {
        self.scratch_dir.join(format!(
            ".downloadcnt.{}.{}.out",
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }
}

impl OperationGateway for CliGateway {
    fn upload(&self, payload: &Path, mode: &UploadMode) -> Result<(), CommandError> {
        let mut args = vec!["upload".to_string(), payload.display().to_string()];
        args.extend(mode.cli_args());
        self.cli.run(args)?;
        Ok(())
    }

    fn pin_status(&self, meta_cid: &str) -> Result<bool, ProbeError> {
        let url = format!("{}/pins/{}", self.endpoints.cluster_api, meta_cid);
        let body = self.get_json(&url)?;
        let pins: PinStatus =
            serde_json::from_value(body).map_err(|e| ProbeError::Body(e.to_string()))?;
        Ok(pins.peer_map.values().all(|p| p.status == "pinned"))
    }

    fn download_count(
        &self,
        file_cid: &str,
        meta_cid: Option<&str>,
        depth: u32,
        with_metrics: bool,
    ) -> Result<Recovery, CommandError> {
        let out = self.scratch_output_path();
        let args = downloadcnt_args(file_cid, meta_cid, depth, &out, with_metrics);
        let command = crate::command::shell_join(&self.cli.with_args(args.clone()));
        self.cli.run(args)?;
        let contents = fs::read_to_string(&out);
        let _ = fs::remove_file(&out);
        let contents = contents.map_err(|e| CommandError::Output {
            command: command.clone(),
            details: format!("reading {}: {}", out.display(), e),
        })?;
        parse_recovery(&contents, with_metrics).map_err(|details| CommandError::Output {
            command,
            details,
        })
    }

    fn trigger_collab_repair(&self, request: &CollabRepairRequest) -> Result<(), ProbeError> {
        let url = format!("{}/triggerCollabRepair", self.endpoints.repair_api);
        let response = self.http.post(url).json(request).send()?;
        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    fn repair_done(&self) -> Result<bool, ProbeError> {
        let body = self.get_json(&format!("{}/done", self.endpoints.control_api))?;
        Ok(body == Value::Bool(true))
    }

    fn fetch_metrics(&self) -> Result<Value, ProbeError> {
        self.get_json(&format!("{}/metrics", self.endpoints.control_api))
    }

    fn count_active_peers(&self) -> Result<usize, ProbeError> {
        let body = self.get_json(&format!("{}/peers", self.endpoints.control_api))?;
        body.as_array()
            .map(Vec::len)
            .ok_or_else(|| ProbeError::Body("expected a JSON array of peers".to_string()))
    }
}

fn downloadcnt_args(
    file_cid: &str,
    meta_cid: Option<&str>,
    depth: u32,
    out: &Path,
    with_metrics: bool,
) -> Vec<String> {
    let mut args = vec!["downloadcnt".to_string(), file_cid.to_string()];
    if let Some(meta) = meta_cid.filter(|m| !m.is_empty()) {
        args.push("-m".to_string());
        args.push(meta.to_string());
    }
    args.push("-o".to_string());
    args.push(out.display().to_string());
    args.push("-d".to_string());
    args.push(depth.to_string());
    if with_metrics {
        args.push("-t".to_string());
    }
    args
}

fn download_args(file_cid: &str, meta_cid: &str, depth: u32, address: &str) -> Vec<String> {
    vec![
        "download".to_string(),
        file_cid.to_string(),
        "-m".to_string(),
        meta_cid.to_string(),
        "-o".to_string(),
        "out".to_string(),
        "-d".to_string(),
        depth.to_string(),
        "-a".to_string(),
        address.to_string(),
    ]
}

fn parse_recovery(contents: &str, with_metrics: bool) -> Result<Recovery, String> {
    if with_metrics {
        serde_json::from_str::<Value>(contents)
            .map(Recovery::Metrics)
            .map_err(|e| format!("metrics document is not JSON: {}", e))
    } else {
        contents
            .trim()
            .parse::<u64>()
            .map(Recovery::Count)
            .map_err(|_| format!("expected a block count, found '{}'", contents.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use std::thread;

    fn serve(responses: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<String>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
        let port = server
            .server_addr()
            .to_ip()
            .expect("ip listener")
            .port();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let mut request = match server.recv() {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let mut content = String::new();
                let _ = request.as_reader().read_to_string(&mut content);
                seen.push(format!("{} {} {}", request.method(), request.url(), content));
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
            seen
        });
        (format!("http://127.0.0.1:{}", port), handle)
    }

    fn gateway(base: &str) -> CliGateway {
        CliGateway::new(
            CommandLine::new(vec!["true".to_string()]),
            std::env::temp_dir(),
            GatewayEndpoints {
                control_api: base.to_string(),
                repair_api: base.to_string(),
                cluster_api: base.to_string(),
                request_timeout: Duration::from_secs(5),
            },
        )
        .expect("client")
    }

    #[test]
    fn pin_status_requires_every_peer_pinned() {
        let (base, handle) = serve(vec![
            (
                200,
                r#"{"peer_map":{"a":{"status":"pinned"},"b":{"status":"pinning"}}}"#,
            ),
            (
                200,
                r#"{"peer_map":{"a":{"status":"pinned"},"b":{"status":"pinned"}}}"#,
            ),
        ]);
        let gw = gateway(&base);
        assert!(!gw.pin_status("QmMeta").expect("pin status"));
        assert!(gw.pin_status("QmMeta").expect("pin status"));
        let seen = handle.join().expect("server thread");
        assert!(seen[0].starts_with("GET /pins/QmMeta"), "{:?}", seen);
    }

    #[test]
    fn non_success_status_is_probe_error() {
        let (base, handle) = serve(vec![(503, "busy")]);
        let err = gateway(&base).repair_done().expect_err("503 must fail");
        assert!(matches!(err, ProbeError::Status(503)), "{}", err);
        handle.join().expect("server thread");
    }

    #[test]
    fn malformed_body_is_probe_error() {
        let (base, handle) = serve(vec![(200, "{not json"), (200, r#"{"peers": 3}"#)]);
        let gw = gateway(&base);
        assert!(matches!(gw.fetch_metrics(), Err(ProbeError::Body(_))));
        assert!(matches!(gw.count_active_peers(), Err(ProbeError::Body(_))));
        handle.join().expect("server thread");
    }

    #[test]
    fn unreachable_endpoint_is_transport_error() {
        let gw = gateway("http://127.0.0.1:9");
        assert!(matches!(gw.repair_done(), Err(ProbeError::Transport(_))));
    }

    #[test]
    fn status_queries_parse_bodies() {
        let (base, handle) = serve(vec![
            (200, "true"),
            (200, "false"),
            (200, r#"["p1","p2","p3"]"#),
            (200, r#"{"repairTime": 12.5}"#),
        ]);
        let gw = gateway(&base);
        assert!(gw.repair_done().expect("done"));
        assert!(!gw.repair_done().expect("done"));
        assert_eq!(gw.count_active_peers().expect("peers"), 3);
        assert_eq!(gw.fetch_metrics().expect("metrics"), json!({"repairTime": 12.5}));
        handle.join().expect("server thread");
    }

    #[test]
    fn collab_trigger_posts_expected_body() {
        let (base, handle) = serve(vec![(200, "")]);
        let request = CollabRepairRequest {
            file_cid: "QmFile".to_string(),
            meta_cid: "QmMeta".to_string(),
            depth: 7,
            origin: String::new(),
            num_peers: 3,
        };
        gateway(&base)
            .trigger_collab_repair(&request)
            .expect("trigger");
        let seen = handle.join().expect("server thread");
        assert!(seen[0].starts_with("POST /triggerCollabRepair "), "{:?}", seen);
        let body: Value =
            serde_json::from_str(seen[0].splitn(3, ' ').nth(2).expect("body")).expect("json");
        assert_eq!(
            body,
            json!({"fileCID": "QmFile", "metaCID": "QmMeta", "depth": 7, "origin": "", "numPeers": 3})
        );
    }

    #[test]
    fn downloadcnt_args_follow_cli_contract() {
        let out = PathBuf::from("/tmp/x.out");
        assert_eq!(
            downloadcnt_args("QmF", Some("QmM"), 5, &out, true),
            vec!["downloadcnt", "QmF", "-m", "QmM", "-o", "/tmp/x.out", "-d", "5", "-t"]
        );
        assert_eq!(
            downloadcnt_args("QmF", Some(""), 1, &out, false),
            vec!["downloadcnt", "QmF", "-o", "/tmp/x.out", "-d", "1"]
        );
        assert_eq!(
            download_args("QmF", "QmM", 5, "localhost:7071"),
            vec!["download", "QmF", "-m", "QmM", "-o", "out", "-d", "5", "-a", "localhost:7071"]
        );
    }

    #[test]
    fn upload_modes_render_flags() {
        let erasure = UploadMode::Erasure {
            alpha: 3,
            s: 5,
            p: 5,
            replication: 20,
        };
        assert_eq!(
            erasure.cli_args(),
            vec!["--alpha", "3", "-s", "5", "-p", "5", "-r", "20"]
        );
        assert_eq!(UploadMode::DirectReplication(3).cli_args(), vec!["-t", "3"]);
    }

    #[test]
    fn parse_recovery_handles_both_shapes() {
        assert_eq!(parse_recovery("1290\n", false), Ok(Recovery::Count(1290)));
        assert!(parse_recovery("", false).is_err());
        assert_eq!(
            parse_recovery(r#"{"blocks": 4}"#, true),
            Ok(Recovery::Metrics(json!({"blocks": 4})))
        );
        assert!(parse_recovery("4", true).is_ok());
        assert!(parse_recovery("{", true).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn download_count_reads_and_removes_output_file() {
        let scratch = std::env::temp_dir().join(format!(
            "sweep_gateway_cnt_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        crate::ensure_dir(&scratch).expect("scratch");
        // Fake storage CLI: writes "42" to the path following -o.
        let script = r#"while [ "$#" -gt 0 ]; do if [ "$1" = "-o" ]; then echo 42 > "$2"; fi; shift; done"#;
        let cli = CommandLine::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "storage-cli".to_string(),
        ]);
        let gw = CliGateway::new(
            cli,
            &scratch,
            GatewayEndpoints {
                control_api: String::new(),
                repair_api: String::new(),
                cluster_api: String::new(),
                request_timeout: Duration::from_secs(1),
            },
        )
        .expect("client");
        let recovered = gw
            .download_count("QmF", Some("QmM"), 5, false)
            .expect("count");
        assert_eq!(recovered, Recovery::Count(42));
        let left = fs::read_dir(&scratch).expect("list").count();
        assert_eq!(left, 0, "output file should be removed");
        let _ = fs::remove_dir_all(scratch);
    }
}
