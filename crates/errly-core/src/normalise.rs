//! Stack-trace normalisation for fingerprinting.
//!
//! Strips variable data (line numbers, absolute paths, addresses, ids) so
//! that the same logical error keeps one fingerprint across deploys and
//! hosts. Normalisation is idempotent: every replacement produces text that
//! no pattern matches again.

use std::sync::LazyLock;

use regex::Regex;

/// Compiled patterns, applied in declaration order.
struct StackPatterns {
    /// UUIDs: `550e8400-e29b-41d4-a716-446655440000`.
    uuids: Regex,
    /// ISO-8601 timestamps: `2024-01-15T10:30:00.123Z`.
    iso_timestamps: Regex,
    /// Space-separated timestamps: `2024-01-15 10:30:00.123`.
    common_timestamps: Regex,
    /// Hex memory addresses: `0x7fff5fbfe000`.
    hex_addresses: Regex,
    /// Node internal frames: `node:internal/modules/cjs/loader:1080`.
    node_internal: Regex,
    /// Process ids: `pid=1234`.
    pids: Regex,
    /// Thread ids: `thread-7`.
    threads: Regex,
    /// Goroutine headers: `goroutine 42`.
    goroutines: Regex,
    /// Local ports: `localhost:3000`.
    localhost_ports: Regex,
    /// Absolute POSIX paths: `/usr/lib/app/handler.js` -> `handler.js`.
    posix_paths: Regex,
    /// Absolute Windows paths: `C:\app\src\Handler.cs` -> `Handler.cs`.
    windows_paths: Regex,
    /// File/line references: `file.ts:10:5` -> `file.ts`.
    file_lines: Regex,
    /// Residual frame tails: `:10:5)` / `:10)` -> `)`.
    frame_tails: Regex,
    /// Epoch-looking integers (10-13 digits).
    epoch_ints: Regex,
}

fn build_patterns() -> Option<StackPatterns> {
    Some(StackPatterns {
        uuids: Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .ok()?,
        iso_timestamps: Regex::new(
            r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
        )
        .ok()?,
        common_timestamps: Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(\.\d+)?").ok()?,
        hex_addresses: Regex::new(r"0x[0-9a-fA-F]{4,}").ok()?,
        node_internal: Regex::new(r"(node:internal/[\w/.\-]+):\d+").ok()?,
        pids: Regex::new(r"\bpid=\d+").ok()?,
        threads: Regex::new(r"\bthread-\d+").ok()?,
        goroutines: Regex::new(r"\bgoroutine \d+").ok()?,
        localhost_ports: Regex::new(r"\blocalhost:\d+").ok()?,
        posix_paths: Regex::new(r#"(?m)(^|[\s("'\[=])/(?:[\w@.\-]+/)+"#).ok()?,
        windows_paths: Regex::new(r#"(?m)(^|[\s("'\[=])[A-Za-z]:[\\/](?:[\w@.\- ]+[\\/])*"#).ok()?,
        file_lines: Regex::new(r"([\w.\-]+\.[A-Za-z]\w*):\d+(:\d+)?").ok()?,
        frame_tails: Regex::new(r":\d+(:\d+)?\)").ok()?,
        epoch_ints: Regex::new(r"\b\d{10,13}\b").ok()?,
    })
}

static PATTERNS: LazyLock<Option<StackPatterns>> = LazyLock::new(build_patterns);

/// Normalise a stack trace for fingerprinting.
///
/// Applies the replacement table in order:
///
/// - UUIDs -> `<uuid>`
/// - timestamps (ISO-8601, `YYYY-MM-DD HH:MM:SS`, 10-13 digit integers)
///   -> `<timestamp>`
/// - hex addresses -> `<addr>`
/// - `pid=N` / `thread-N` / `goroutine N` -> placeholder ids
/// - `localhost:PORT` -> `localhost:<port>`
/// - absolute POSIX and Windows paths -> basename only
/// - `file.ext:LINE(:COL)?` -> `file.ext`, residual `:LINE)` tails -> `)`
/// - `node:internal/...:N` -> path only
///
/// Relative paths are kept: continuation frames such as `at src/lib.rs` are
/// already stable across hosts.
#[must_use]
pub fn normalise_stack(stack: &str) -> String {
    let Some(p) = PATTERNS.as_ref() else {
        return stack.to_owned();
    };

    let mut s = stack.to_owned();
    s = p.uuids.replace_all(&s, "<uuid>").to_string();
    s = p.iso_timestamps.replace_all(&s, "<timestamp>").to_string();
    s = p
        .common_timestamps
        .replace_all(&s, "<timestamp>")
        .to_string();
    s = p.hex_addresses.replace_all(&s, "<addr>").to_string();
    s = p.node_internal.replace_all(&s, "$1").to_string();
    s = p.pids.replace_all(&s, "pid=<pid>").to_string();
    s = p.threads.replace_all(&s, "thread-<tid>").to_string();
    s = p.goroutines.replace_all(&s, "goroutine <id>").to_string();
    s = p
        .localhost_ports
        .replace_all(&s, "localhost:<port>")
        .to_string();
    s = p.posix_paths.replace_all(&s, "$1").to_string();
    s = p.windows_paths.replace_all(&s, "$1").to_string();
    s = p.file_lines.replace_all(&s, "$1").to_string();
    s = p.frame_tails.replace_all(&s, ")").to_string();
    s = p.epoch_ints.replace_all(&s, "<timestamp>").to_string();
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_uuids() {
        let out = normalise_stack("request 550e8400-e29b-41d4-a716-446655440000 failed");
        assert_eq!(out, "request <uuid> failed");
    }

    #[test]
    fn strips_iso_timestamps() {
        let out = normalise_stack("at 2024-01-15T10:30:00.123Z the world ended");
        assert_eq!(out, "at <timestamp> the world ended");
    }

    #[test]
    fn strips_common_timestamps() {
        let out = normalise_stack("2024-01-15 10:30:00.500 boom");
        assert_eq!(out, "<timestamp> boom");
    }

    #[test]
    fn strips_hex_addresses() {
        let out = normalise_stack("segfault at 0x7fff5fbfe000");
        assert_eq!(out, "segfault at <addr>");
    }

    #[test]
    fn strips_epoch_integers() {
        let out = normalise_stack("deadline 1705312200000 exceeded");
        assert_eq!(out, "deadline <timestamp> exceeded");
        // Shorter integers are kept.
        assert_eq!(normalise_stack("retried 42 times"), "retried 42 times");
    }

    #[test]
    fn replaces_pid_and_thread_ids() {
        let out = normalise_stack("worker pid=31337 thread-8 crashed");
        assert_eq!(out, "worker pid=<pid> thread-<tid> crashed");
    }

    #[test]
    fn replaces_goroutine_ids() {
        let out = normalise_stack("goroutine 187 [running]:");
        assert_eq!(out, "goroutine <id> [running]:");
    }

    #[test]
    fn replaces_localhost_ports() {
        let out = normalise_stack("connect ECONNREFUSED localhost:5432");
        assert_eq!(out, "connect ECONNREFUSED localhost:<port>");
    }

    #[test]
    fn posix_paths_reduce_to_basename() {
        let out = normalise_stack("at handler (/app/dist/routes/users.js:88:13)");
        assert_eq!(out, "at handler (users.js)");
    }

    #[test]
    fn windows_paths_reduce_to_basename() {
        let out = normalise_stack(r"at App.Run() in C:\build\src\Program.cs:line 42");
        assert!(out.contains("Program.cs"));
        assert!(!out.contains("build"));
    }

    #[test]
    fn file_line_references_lose_line_numbers() {
        let out = normalise_stack("    at f (a.ts:10:1)");
        assert_eq!(out, "    at f (a.ts)");
    }

    #[test]
    fn frame_tails_without_extension_lose_line_numbers() {
        let out = normalise_stack("at eval (<anonymous>:3:9)");
        assert_eq!(out, "at eval (<anonymous>)");
    }

    #[test]
    fn node_internal_keeps_path() {
        let out = normalise_stack("at node:internal/modules/cjs/loader:1080");
        assert_eq!(out, "at node:internal/modules/cjs/loader");
    }

    #[test]
    fn idempotent() {
        let inputs = [
            "TypeError: x\n    at f (/srv/app/a.ts:10:1)\n    at g (a.ts:20:2)",
            "goroutine 7 [running]:\nmain.go:44 +0x1a2b pid=99",
            "at 2024-01-15T10:30:00Z id 550e8400-e29b-41d4-a716-446655440000",
        ];
        for input in inputs {
            let once = normalise_stack(input);
            assert_eq!(normalise_stack(&once), once, "not idempotent: {input}");
        }
    }

    #[test]
    fn stable_across_redeploys() {
        let a = "TypeError: x\n    at f (/srv/release-1/app/a.ts:10:1)";
        let b = "TypeError: x\n    at f (/srv/release-2/app/a.ts:99:7)";
        assert_eq!(normalise_stack(a), normalise_stack(b));
    }
}
