//! Namespace-sandbox isolation (Strict tier)
//!
//! Assembles single firejail or bubblewrap invocations: no network, no new
//! capabilities, rlimits on cpu/memory/processes/file size, private temp
//! area, workspace bound read-only or read-write per session. Nothing
//! persists afterwards, so this tier has no teardown resource.

use crate::sandbox::SandboxSession;

pub(super) fn firejail_args(
    session: &SandboxSession,
    executable: &str,
    args: &[String],
) -> Vec<String> {
    let limits = &session.limits;
    let mut fj = vec![
        "--quiet".to_string(),
        "--seccomp".to_string(),
        "--net=none".to_string(),
        "--noroot".to_string(),
        "--caps.drop=all".to_string(),
        format!("--rlimit-cpu={}", session.deadline.as_secs().max(1)),
        format!("--rlimit-as={}", limits.max_memory_mb * 1024 * 1024),
        format!("--rlimit-nproc={}", limits.max_processes),
        format!("--rlimit-fsize={}", limits.max_file_size_mb * 1024 * 1024),
        "--private-dev".to_string(),
        "--private-tmp".to_string(),
        "--read-only=/".to_string(),
        "--private-etc=resolv.conf,hostname,hosts".to_string(),
    ];

    let workspace = session.workspace.display();
    if session.read_only {
        fj.push(format!("--read-only={workspace}"));
    } else {
        fj.push(format!("--whitelist={workspace}"));
    }

    fj.push(executable.to_string());
    fj.extend_from_slice(args);
    fj
}

pub(super) fn bwrap_args(
    session: &SandboxSession,
    executable: &str,
    args: &[String],
) -> Vec<String> {
    let mut bw: Vec<String> = [
        "--ro-bind", "/usr", "/usr",
        "--ro-bind", "/lib", "/lib",
        "--ro-bind", "/lib64", "/lib64",
        "--ro-bind", "/bin", "/bin",
        "--ro-bind", "/sbin", "/sbin",
        "--tmpfs", "/tmp",
        "--proc", "/proc",
        "--dev", "/dev",
        "--unshare-net",
        "--unshare-pid",
        "--die-with-parent",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let workspace = session.workspace.display().to_string();
    let bind = if session.read_only { "--ro-bind" } else { "--bind" };
    bw.extend([bind.to_string(), workspace.clone(), workspace]);

    bw.push(executable.to_string());
    bw.extend_from_slice(args);
    bw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::path::Path;
    use std::time::Duration;

    fn session(read_only: bool) -> SandboxSession {
        let limits = SandboxConfig::default();
        if read_only {
            SandboxSession::run(Path::new("/tmp/ws"), &limits, Duration::from_secs(10))
        } else {
            SandboxSession::compile(Path::new("/tmp/ws"), &limits)
        }
    }

    #[test]
    fn test_firejail_denies_network_and_caps() {
        let args = firejail_args(&session(false), "gcc", &["main.c".to_string()]);
        assert!(args.contains(&"--net=none".to_string()));
        assert!(args.contains(&"--caps.drop=all".to_string()));
        assert!(args.contains(&"--seccomp".to_string()));
        assert!(args.contains(&"--rlimit-as=134217728".to_string()));
        assert!(args.contains(&"--whitelist=/tmp/ws".to_string()));
        assert_eq!(&args[args.len() - 2..], ["gcc", "main.c"]);
    }

    #[test]
    fn test_firejail_run_session_binds_workspace_read_only() {
        let args = firejail_args(&session(true), "./program", &[]);
        assert!(args.contains(&"--read-only=/tmp/ws".to_string()));
        assert!(args.contains(&"--rlimit-cpu=10".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--whitelist")));
    }

    #[test]
    fn test_bwrap_unshares_namespaces() {
        let args = bwrap_args(&session(true), "./program", &[]);
        assert!(args.contains(&"--unshare-net".to_string()));
        assert!(args.contains(&"--unshare-pid".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));

        // Workspace bound read-only for run sessions
        let idx = args
            .iter()
            .rposition(|a| a == "--ro-bind")
            .expect("workspace bind present");
        assert_eq!(args[idx + 1], "/tmp/ws");
        assert_eq!(args[idx + 2], "/tmp/ws");
    }

    #[test]
    fn test_bwrap_compile_session_binds_workspace_rw() {
        let args = bwrap_args(&session(false), "gcc", &["main.c".to_string()]);
        let idx = args.iter().position(|a| a == "--bind").expect("rw bind");
        assert_eq!(args[idx + 1], "/tmp/ws");
    }
}
