//! Fixtures shared by the executor tests: candle builders, throwaway script
//! directories and a runner that counts instead of spawning.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use crate::executor::launcher::{LaunchError, ScriptRunner};
use crate::types::{Candle, IndicatorRequest};

/// `n` ascending one-minute bars; bar `i` closes at `100 + i`.
pub fn bars(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = 100.0 + i as f64;
            Candle {
                time: 1_700_000_000 + i as i64 * 60,
                open: close - 0.5,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

/// Temp directory holding one `<name>.sh` per entry.
pub fn sh_scripts(scripts: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in scripts {
        std::fs::write(
            dir.path().join(format!("{name}.sh")),
            format!("#!/bin/sh\n{body}\n"),
        )
        .unwrap();
    }
    dir
}

/// Describe-aware simple moving average over `close`, emitting one value per
/// bar once the window is full.
pub const SMA_SCRIPT: &str = r##"input=$(cat)
case "$input" in
  *'"mode":"describe"'*)
    echo '{"success":true,"name":"sma","displayName":"Simple Moving Average","version":"1.0.0","chartType":"main","parameters":[{"name":"period","type":"number","default":20,"min":1,"max":200,"displayName":"Period"}]}'
    exit 0
    ;;
esac
printf '%s' "$input" | awk '
{ buf = buf $0 }
END {
  period = 20
  if (match(buf, /"period":[0-9]+/)) period = substr(buf, RSTART + 9, RLENGTH - 9) + 0
  n = 0
  rest = buf
  while (match(rest, /"time":-?[0-9]+/)) {
    n++
    t[n] = substr(rest, RSTART + 7, RLENGTH - 7)
    rest = substr(rest, RSTART + RLENGTH)
    match(rest, /"close":-?[0-9.eE+-]+/)
    c[n] = substr(rest, RSTART + 8, RLENGTH - 8) + 0
    rest = substr(rest, RSTART + RLENGTH)
  }
  printf "{\"success\":true,\"displayType\":\"single-line\",\"values\":["
  sum = 0
  first = 1
  for (i = 1; i <= n; i++) {
    sum += c[i]
    if (i > period) sum -= c[i - period]
    if (i >= period) {
      if (!first) printf ","
      printf "{\"time\":%s,\"value\":%.10g}", t[i], sum / period
      first = 0
    }
  }
  printf "],\"metadata\":{\"indicator\":\"sma\",\"version\":\"1.0.0\",\"period\":%d}}\n", period
}'"##;

/// Describe output for a well-behaved fixture named `name`.
pub fn describe_script(name: &str) -> String {
    format!(
        r#"echo '{{"success":true,"name":"{name}","version":"1.0.0","chartType":"sub","parameters":[{{"name":"period","type":"number","default":14}}]}}'"#
    )
}

/// Runner that records calls and answers every request with `response`.
pub struct CountingRunner {
    calls: AtomicUsize,
    response: Value,
}

impl CountingRunner {
    pub fn new(response: Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScriptRunner for CountingRunner {
    async fn run(
        &self,
        _script: &Path,
        _request: &IndicatorRequest,
        _timeout: Duration,
    ) -> Result<Value, LaunchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}
