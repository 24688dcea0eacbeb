//! Log-line classification.
//!
//! Decides whether a single log line represents an error, at what severity,
//! which endpoint it concerns, and which language runtime produced it.
//!
//! The decision order is deliberate: a structured `level=info|debug|trace`
//! marker vetoes everything else, even an `[err]` bracket on the outer line,
//! because many runtimes route informational output through stderr. This can
//! in principle mask an error line that merely mentions `level=info` in free
//! text; the behaviour is intentional and kept for operator review.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::Severity;

/// Outcome of classifying one log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Whether the line represents an error (or warning) condition.
    pub is_error: bool,
    /// Severity under the `warn < error < fatal` ladder.
    pub severity: Severity,
    /// The trimmed line, used as the error message.
    pub message: String,
    /// `"METHOD /path"` if the line references an HTTP request.
    pub endpoint: Option<String>,
}

/// Language runtime inferred from trace syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    /// JavaScript / TypeScript (`at f (file.js:1:2)`).
    Node,
    /// Python (`Traceback`, `File "..."`).
    Python,
    /// Go (`panic:`, `goroutine N`).
    Go,
    /// JVM languages (`at com.example.Foo(Foo.java:1)`, `Caused by:`).
    Java,
    /// Ruby (`from /path:1:in `method'`).
    Ruby,
    /// Rust (`thread '...' panicked`, `stack backtrace:`).
    Rust,
    /// PHP (`PHP Fatal error:`, `#0 /path`).
    Php,
    /// .NET (`System.*Exception`, `at Namespace.Class.Method(...)`).
    DotNet,
    /// Could not be determined; generic continuation rules apply.
    #[default]
    Unknown,
}

struct ClassifierPatterns {
    structured_info: Regex,
    structured_error: Regex,
    structured_fatal: Regex,
    bracket_error: Regex,
    bracket_fatal: Regex,
    prefix_error: Regex,
    prefix_fatal: Regex,
    uncaught: Regex,
    exception_name: Regex,
    http_5xx: Regex,
    http_4xx: Regex,
    exit_code: Regex,
    python: Regex,
    java: Regex,
    go: Regex,
    ruby: Regex,
    rust: Regex,
    php: Regex,
    php_fatal: Regex,
    dotnet: Regex,
    infra: Regex,
    deprecation: Regex,
    warn_marker: Regex,
    fatal_signal: Regex,
    endpoint_status_5xx: Regex,
    endpoint_status_4xx: Regex,
    endpoint_kv: Regex,
    endpoint_failed: Regex,
    endpoint_quoted: Regex,
    trace_start: Regex,
    frame_at: Regex,
    java_file: Regex,
    dotnet_ns: Regex,
    ruby_frame: Regex,
    structured_log_prefix: Regex,
}

fn build_patterns() -> Option<ClassifierPatterns> {
    Some(ClassifierPatterns {
        structured_info: Regex::new(
            r#"(?i)(?:\blevel\s*=\s*"?|"level"\s*:\s*")(info|debug|trace)\b"#,
        )
        .ok()?,
        structured_error: Regex::new(
            r#"(?i)(?:\blevel\s*=\s*"?|"level"\s*:\s*")(error|fatal|critical)\b"#,
        )
        .ok()?,
        structured_fatal: Regex::new(
            r#"(?i)(?:\blevel\s*=\s*"?|"level"\s*:\s*")(fatal|critical)\b"#,
        )
        .ok()?,
        bracket_error: Regex::new(r"(?i)\[(error|err|fatal|critical)\]").ok()?,
        bracket_fatal: Regex::new(r"(?i)\[(fatal|critical)\]").ok()?,
        prefix_error: Regex::new(r"(?:^|\s)(ERROR|FATAL|CRITICAL|PANIC):").ok()?,
        prefix_fatal: Regex::new(r"(?:^|\s)(FATAL|CRITICAL):").ok()?,
        uncaught: Regex::new(
            r"\b(?:Uncaught|Unhandled)\b|unhandledRejection|\b(?:TypeError|ReferenceError|SyntaxError|RangeError|EvalError|URIError)\b",
        )
        .ok()?,
        exception_name: Regex::new(r"(?:^|\s)[\w$.]*(?:Error|Exception)\b\s*[:(]").ok()?,
        http_5xx: Regex::new(
            r#""[A-Z]+ [^"]*"\s+5\d\d\b|\bstatus\s*[=:]?\s*5\d\d\b|HTTP/\d(?:\.\d)?"?\s+5\d\d\b"#,
        )
        .ok()?,
        http_4xx: Regex::new(
            r#""[A-Z]+ [^"]*"\s+4\d\d\b|\bstatus\s*[=:]?\s*4\d\d\b|HTTP/\d(?:\.\d)?"?\s+4\d\d\b"#,
        )
        .ok()?,
        exit_code: Regex::new(r"(?i)\bexit(?:ed)?(?:\s+with)?\s+code\s+[1-9]\d*|\bnon-zero exit\b")
            .ok()?,
        python: Regex::new(r#"^Traceback \(most recent call last\)|^\s+File "[^"]+", line \d+"#)
            .ok()?,
        java: Regex::new(r"\bException in thread\b|^\s*Caused by:").ok()?,
        go: Regex::new(r"^panic:|^goroutine \d+|\bruntime error:").ok()?,
        ruby: Regex::new(
            r"\(\w+(?:::\w+)*(?:Error|Exception)\)|\b(?:NoMethodError|NameError|ArgumentError|RuntimeError)\b",
        )
        .ok()?,
        rust: Regex::new(r"thread '[^']*' panicked|^stack backtrace:").ok()?,
        php: Regex::new(r"\bPHP (?:Fatal error|Parse error|Warning|Notice)\b|^Fatal error:").ok()?,
        php_fatal: Regex::new(r"\bPHP (?:Fatal error|Parse error)\b|^Fatal error:").ok()?,
        dotnet: Regex::new(r"\bSystem\.\w+(?:\.\w+)*Exception\b|\bUnhandled exception\b").ok()?,
        infra: Regex::new(
            r"(?i)\b(?:ECONNREFUSED|ETIMEDOUT|ECONNRESET|EHOSTUNREACH|EPIPE|ENOTFOUND)\b|connection refused|pool exhausted|FATAL:\s+too many connections|\bNOAUTH\b",
        )
        .ok()?,
        deprecation: Regex::new(r"(?i)\bdeprecat(?:ed|ion)\b|\bslow quer(?:y|ies)\b").ok()?,
        warn_marker: Regex::new(r"(?i)\[warn(?:ing)?\]|(?:^|\s)WARN(?:ING)?:").ok()?,
        fatal_signal: Regex::new(
            r"\b(?:SIGTERM|SIGSEGV|SIGABRT|SIGKILL|SIGILL|SIGBUS)\b|(?i)\bOOM\b|(?i)out of memory|(?i)\bkilled\b",
        )
        .ok()?,
        endpoint_status_5xx: Regex::new(r#""([A-Z]+) (/[^\s"]*)[^"]*"\s+5\d\d\b"#).ok()?,
        endpoint_status_4xx: Regex::new(r#""([A-Z]+) (/[^\s"]*)[^"]*"\s+4\d\d\b"#).ok()?,
        endpoint_kv: Regex::new(r"\bmethod=(\w+)\s+path=(/\S*)\s+status=[45]\d\d\b").ok()?,
        endpoint_failed: Regex::new(r"\b(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS)\s+(/\S+)\s+failed\b")
            .ok()?,
        endpoint_quoted: Regex::new(r#""(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS) (/[^\s"]*)[^"]*""#)
            .ok()?,
        trace_start: Regex::new(
            r#"(?:^|\s)[\w$.]*(?:Error|Exception)\b\s*[:(]|\(\w+(?:::\w+)*(?:Error|Exception)\)|^\s+at\s|^Traceback \(most recent call last\)|^panic:|^goroutine \d+|thread '[^']*' panicked|^stack backtrace:|\bPHP (?:Fatal error|Parse error)\b|^Fatal error:|\bUnhandled exception\b|\bException in thread\b"#,
        )
        .ok()?,
        frame_at: Regex::new(r"^\s+at\s+").ok()?,
        java_file: Regex::new(r"\.(?:java|kt|scala):\d+").ok()?,
        dotnet_ns: Regex::new(r"\bSystem\.").ok()?,
        ruby_frame: Regex::new(r"^\s*from /|:\d+:in `").ok()?,
        structured_log_prefix: Regex::new(r"^\s*(?:\d{4}-\d{2}-\d{2}|\[[^\]]*\])").ok()?,
    })
}

static PATTERNS: LazyLock<Option<ClassifierPatterns>> = LazyLock::new(build_patterns);

/// Classify a single log line.
///
/// First match wins for the error decision; severity has its own precedence
/// (fatal patterns, then explicit fatal markers, then any error pattern,
/// then warn-only patterns).
#[must_use]
pub fn classify(line: &str) -> Classification {
    let message = line.trim().to_owned();
    let Some(p) = PATTERNS.as_ref() else {
        return Classification {
            is_error: false,
            severity: Severity::Error,
            message,
            endpoint: None,
        };
    };

    // Structured info/debug/trace markers veto everything else.
    if p.structured_info.is_match(line) {
        return Classification {
            is_error: false,
            severity: Severity::Error,
            message,
            endpoint: extract_endpoint(line),
        };
    }

    let error_matched = p.trace_start.is_match(line)
        || p.bracket_error.is_match(line)
        || p.prefix_error.is_match(line)
        || p.structured_error.is_match(line)
        || p.uncaught.is_match(line)
        || p.exception_name.is_match(line)
        || p.http_5xx.is_match(line)
        || p.exit_code.is_match(line)
        || p.python.is_match(line)
        || p.java.is_match(line)
        || p.go.is_match(line)
        || p.ruby.is_match(line)
        || p.rust.is_match(line)
        || p.php_fatal.is_match(line)
        || p.dotnet.is_match(line)
        || p.infra.is_match(line)
        || p.fatal_signal.is_match(line);

    let warn_matched = p.http_4xx.is_match(line)
        || p.deprecation.is_match(line)
        || p.warn_marker.is_match(line)
        || p.php.is_match(line);

    let is_error = error_matched || warn_matched;
    if !is_error {
        return Classification {
            is_error: false,
            severity: Severity::Error,
            message,
            endpoint: None,
        };
    }

    let severity = if p.fatal_signal.is_match(line)
        || p.bracket_fatal.is_match(line)
        || p.prefix_fatal.is_match(line)
        || p.structured_fatal.is_match(line)
    {
        Severity::Fatal
    } else if error_matched {
        Severity::Error
    } else {
        Severity::Warn
    };

    Classification {
        is_error: true,
        severity,
        message,
        endpoint: extract_endpoint(line),
    }
}

/// Extract `"METHOD /path"` from a log line, trying the most specific
/// shapes first: quoted request with 5xx status, with 4xx status,
/// `method=... path=... status=...`, `METHOD /path failed`, then any
/// quoted request.
#[must_use]
pub fn extract_endpoint(line: &str) -> Option<String> {
    let p = PATTERNS.as_ref()?;
    for re in [
        &p.endpoint_status_5xx,
        &p.endpoint_status_4xx,
        &p.endpoint_kv,
        &p.endpoint_failed,
        &p.endpoint_quoted,
    ] {
        if let Some(caps) = re.captures(line) {
            let method = caps.get(1)?.as_str();
            let path = caps.get(2)?.as_str();
            return Some(format!("{method} {path}"));
        }
    }
    None
}

/// Whether this line opens a multi-line stack trace.
#[must_use]
pub fn is_trace_start(line: &str) -> bool {
    PATTERNS
        .as_ref()
        .is_some_and(|p| p.trace_start.is_match(line))
}

/// Whether the line carries a structured `info`/`debug`/`trace` level
/// marker - the veto that keeps info-routed-through-stderr out of the
/// error stream, and that blocks severity synthesis from platform
/// metadata.
#[must_use]
pub fn has_structured_info_level(line: &str) -> bool {
    PATTERNS
        .as_ref()
        .is_some_and(|p| p.structured_info.is_match(line))
}

/// Infer the language runtime from trace syntax.
#[must_use]
pub fn infer_language(line: &str) -> Language {
    let Some(p) = PATTERNS.as_ref() else {
        return Language::Unknown;
    };

    if p.frame_at.is_match(line) {
        if p.java_file.is_match(line) {
            return Language::Java;
        }
        if p.dotnet_ns.is_match(line) {
            return Language::DotNet;
        }
        return Language::Node;
    }
    if p.python.is_match(line) {
        return Language::Python;
    }
    if p.go.is_match(line) {
        return Language::Go;
    }
    if p.java.is_match(line) {
        return Language::Java;
    }
    if p.rust.is_match(line) {
        return Language::Rust;
    }
    if p.php.is_match(line) {
        return Language::Php;
    }
    if p.dotnet.is_match(line) {
        return Language::DotNet;
    }
    if p.ruby.is_match(line) || p.ruby_frame.is_match(line) {
        return Language::Ruby;
    }
    if p.uncaught.is_match(line) || p.exception_name.is_match(line) {
        return Language::Node;
    }
    Language::Unknown
}

/// Whether `line` continues a trace of the given language.
#[must_use]
pub fn continues_trace(language: Language, line: &str) -> bool {
    let Some(p) = PATTERNS.as_ref() else {
        return false;
    };

    // Nested causes attach to any trace.
    if line.trim_start().starts_with("[cause]:") || line.trim_start().starts_with("Caused by:") {
        return true;
    }

    match language {
        Language::Node => p.frame_at.is_match(line),
        Language::Java => {
            p.frame_at.is_match(line)
                || line.trim_start().starts_with("...")
                || line.trim_end().ends_with("more")
        }
        Language::DotNet => p.frame_at.is_match(line) || line.trim_start().starts_with("--- End of"),
        Language::Python => {
            line.starts_with("  ")
                || p.python.is_match(line)
                || p.exception_name.is_match(line)
        }
        Language::Go => {
            line.starts_with('\t')
                || line.starts_with("goroutine")
                || line.starts_with(' ')
                || line.contains(".go:")
        }
        Language::Ruby => p.ruby_frame.is_match(line),
        Language::Rust => {
            line.starts_with("stack backtrace:")
                || rust_frame(line)
        }
        Language::Php => php_frame(line),
        Language::Unknown => {
            line.starts_with("  ") && !p.structured_log_prefix.is_match(line.trim_start())
        }
    }
}

/// Rust backtrace frames: `   3: core::panicking::panic` or `at src/main.rs`.
fn rust_frame(line: &str) -> bool {
    static FRAME: LazyLock<Option<Regex>> =
        LazyLock::new(|| Regex::new(r"^\s+at src/|^\s+\d+:\s").ok());
    FRAME.as_ref().is_some_and(|re| re.is_match(line))
}

/// PHP backtrace frames: `#0 /path/to/file.php(10): f()`.
fn php_frame(line: &str) -> bool {
    static FRAME: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\s*#\d+\s+").ok());
    FRAME.as_ref().is_some_and(|re| re.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_error(line: &str, severity: Severity) {
        let c = classify(line);
        assert!(c.is_error, "expected error: {line}");
        assert_eq!(c.severity, severity, "severity mismatch: {line}");
    }

    fn assert_not_error(line: &str) {
        assert!(!classify(line).is_error, "expected non-error: {line}");
    }

    #[test]
    fn structured_info_overrides_err_bracket() {
        assert_not_error(r#"[err] level=info msg="listening on :8080""#);
        assert_not_error(r#"{"level":"debug","msg":"tick"}"#);
        assert_not_error("level=trace polling upstream");
    }

    #[test]
    fn plain_lines_are_not_errors() {
        assert_not_error("request completed");
        assert_not_error("GET /healthz 200 2ms");
        assert_not_error("user signed in");
    }

    #[test]
    fn explicit_markers() {
        assert_error("[ERROR] db write failed", Severity::Error);
        assert_error("ERROR: db write failed", Severity::Error);
        assert_error("[FATAL] shutting down", Severity::Fatal);
        assert_error("FATAL: too many connections", Severity::Fatal);
        assert_error("[CRITICAL] disk full", Severity::Fatal);
    }

    #[test]
    fn structured_error_levels() {
        assert_error(r#"level=error msg="boom""#, Severity::Error);
        assert_error(r#"{"level":"fatal","msg":"boom"}"#, Severity::Fatal);
    }

    #[test]
    fn uncaught_exceptions() {
        assert_error("TypeError: x is not a function", Severity::Error);
        assert_error("Uncaught ReferenceError: y is not defined", Severity::Error);
        assert_error("unhandledRejection: oops", Severity::Error);
    }

    #[test]
    fn http_5xx_is_error_4xx_is_warn() {
        assert_error(r#""POST /api/users" 500 12ms"#, Severity::Error);
        assert_error(r#""GET /api/users/7" 404 1ms"#, Severity::Warn);
    }

    #[test]
    fn language_specific_errors() {
        assert_error("Traceback (most recent call last):", Severity::Error);
        assert_error(
            "Exception in thread \"main\" java.lang.NullPointerException",
            Severity::Error,
        );
        assert_error("panic: runtime error: index out of range", Severity::Error);
        assert_error("thread 'main' panicked at src/main.rs:10:5", Severity::Error);
        assert_error("PHP Fatal error:  Uncaught Error: Call to undefined", Severity::Error);
        assert_error(
            "System.NullReferenceException: Object reference not set",
            Severity::Error,
        );
        assert_error("undefined method `save' for nil (NoMethodError)", Severity::Error);
    }

    #[test]
    fn infra_errors() {
        assert_error("connect ECONNREFUSED 127.0.0.1:5432", Severity::Error);
        assert_error("Error: connection refused by upstream", Severity::Error);
        assert_error("db pool exhausted after 30s", Severity::Error);
        assert_error("NOAUTH Authentication required.", Severity::Error);
    }

    #[test]
    fn warn_patterns() {
        assert_error("DeprecationWarning: Buffer() is deprecated", Severity::Warn);
        assert_error("[WARN] retrying in 5s", Severity::Warn);
        assert_error("WARNING: slow query took 4213ms", Severity::Warn);
    }

    #[test]
    fn fatal_signals() {
        assert_error("worker received SIGSEGV", Severity::Fatal);
        assert_error("container killed: out of memory", Severity::Fatal);
        assert_error("OOM while allocating buffer", Severity::Fatal);
    }

    #[test]
    fn exit_codes() {
        assert_error("process exited with code 1", Severity::Error);
        assert_not_error("process exited with code 0");
    }

    #[test]
    fn endpoint_extraction_ladder() {
        assert_eq!(
            classify(r#""POST /api/orders HTTP/1.1" 502 9ms"#).endpoint,
            Some("POST /api/orders".to_owned())
        );
        assert_eq!(
            classify("ERROR method=GET path=/api/items status=500").endpoint,
            Some("GET /api/items".to_owned())
        );
        assert_eq!(
            classify("ERROR: POST /checkout failed with timeout").endpoint,
            Some("POST /checkout".to_owned())
        );
        assert_eq!(classify("[ERROR] db write failed").endpoint, None);
    }

    #[test]
    fn trace_start_detection() {
        assert!(is_trace_start("TypeError: x"));
        assert!(is_trace_start("    at f (a.ts:10:1)"));
        assert!(is_trace_start("Traceback (most recent call last):"));
        assert!(is_trace_start("panic: boom"));
        assert!(is_trace_start("goroutine 12 [running]:"));
        assert!(is_trace_start("thread 'main' panicked at src/lib.rs:9:9"));
        assert!(is_trace_start("Unhandled exception. System.Exception: x"));
        assert!(!is_trace_start("ERROR: flat message"));
        assert!(!is_trace_start("connect ECONNREFUSED 10.0.0.2:443"));
    }

    #[test]
    fn language_inference() {
        assert_eq!(infer_language("    at f (a.ts:10:1)"), Language::Node);
        assert_eq!(
            infer_language("    at com.example.Foo.bar(Foo.java:12)"),
            Language::Java
        );
        assert_eq!(
            infer_language("   at System.Linq.Enumerable.First[TSource]"),
            Language::DotNet
        );
        assert_eq!(
            infer_language("Traceback (most recent call last):"),
            Language::Python
        );
        assert_eq!(infer_language("goroutine 5 [running]:"), Language::Go);
        assert_eq!(infer_language("Caused by: java.io.IOException"), Language::Java);
        assert_eq!(
            infer_language("thread 'main' panicked at src/main.rs:3:3"),
            Language::Rust
        );
        assert_eq!(infer_language("PHP Fatal error:  oops"), Language::Php);
        assert_eq!(infer_language("TypeError: x"), Language::Node);
    }

    #[test]
    fn continuation_rules() {
        assert!(continues_trace(Language::Node, "    at g (b.ts:3:4)"));
        assert!(!continues_trace(Language::Node, "request completed"));
        assert!(continues_trace(
            Language::Python,
            r#"  File "app.py", line 3, in main"#
        ));
        assert!(continues_trace(Language::Python, "ValueError: bad input"));
        assert!(continues_trace(Language::Go, "\tmain.main()"));
        assert!(continues_trace(Language::Go, "goroutine 6 [select]:"));
        assert!(continues_trace(Language::Java, "\t... 12 more"));
        assert!(continues_trace(Language::Ruby, "from /app/lib/worker.rb:4:in `run'"));
        assert!(continues_trace(Language::Rust, "   2: core::panicking::panic"));
        assert!(continues_trace(Language::Php, "#0 /var/www/index.php(10): f()"));
        assert!(continues_trace(Language::DotNet, "--- End of inner exception stack trace ---"));
        assert!(continues_trace(Language::Unknown, "  some indented detail"));
        assert!(!continues_trace(
            Language::Unknown,
            "  2024-01-15 10:00:00 next request"
        ));
        // Nested causes attach regardless of language.
        assert!(continues_trace(Language::Node, "[cause]: Error: inner"));
        assert!(continues_trace(Language::Java, "Caused by: java.io.EOFException"));
    }
}
