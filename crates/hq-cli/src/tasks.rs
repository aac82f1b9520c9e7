//! Tasks every `hq` process registers.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use hq_scheduler::{ParamKind, ParamSpec, TaskContext, TaskRegistry};
use serde_json::{json, Map, Value};

pub fn register_builtin(registry: &mut TaskRegistry) -> hq_scheduler::Result<()> {
    registry
        .register(
            "http_ping",
            "HTTP ping",
            Some("GET a URL and report its status and headers"),
            http_ping,
        )?
        .param(ParamSpec::required("url", ParamKind::String))
        .param(ParamSpec::optional("expect_status", ParamKind::Integer));

    registry
        .register("sleep", "Sleep", Some("Wait for a number of seconds"), sleep)?
        .param(ParamSpec::required("seconds", ParamKind::Number));

    registry
        .register("echo", "Echo", Some("Return the job parameters"), echo)?
        .param(ParamSpec::optional("message", ParamKind::Any));

    Ok(())
}

async fn http_ping(ctx: TaskContext) -> anyhow::Result<Value> {
    let url = ctx
        .param("url")
        .and_then(Value::as_str)
        .context("'url' must be a string")?
        .to_string();

    let client = reqwest::Client::new();
    let started = Instant::now();
    let response = tokio::select! {
        r = client.get(&url).send() => r.with_context(|| format!("GET {url}"))?,
        _ = ctx.cancel.cancelled() => bail!("GET {url} cancelled"),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let status = response.status();
    match ctx.param("expect_status").and_then(Value::as_u64) {
        Some(expected) if u64::from(status.as_u16()) != expected => {
            bail!("{url} returned {status}, expected {expected}")
        }
        None if !status.is_success() => bail!("{url} returned {status}"),
        _ => {}
    }

    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            let v = String::from_utf8_lossy(v.as_bytes()).into_owned();
            (k.to_string(), Value::String(v))
        })
        .collect();

    Ok(json!({
        "url": url,
        "status": status.as_u16(),
        "elapsed_ms": elapsed_ms,
        "headers": headers,
    }))
}

async fn sleep(ctx: TaskContext) -> anyhow::Result<Value> {
    let secs = ctx
        .param("seconds")
        .and_then(Value::as_f64)
        .context("'seconds' must be a number")?;
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow::anyhow!("'seconds' must be a non-negative number, got {secs}"))?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(json!({ "slept": secs })),
        _ = ctx.cancel.cancelled() => bail!("sleep cancelled"),
    }
}

async fn echo(ctx: TaskContext) -> anyhow::Result<Value> {
    Ok(Value::Object(ctx.params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(params: Value) -> TaskContext {
        TaskContext {
            job_id: "job".into(),
            params: params.as_object().cloned().unwrap_or_default(),
            attempt: 0,
            cancel: Default::default(),
        }
    }

    #[test]
    fn builtins_register_once() {
        let mut reg = TaskRegistry::new();
        register_builtin(&mut reg).unwrap();
        let names: Vec<_> = reg.list().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["http_ping", "sleep", "echo"]);
        assert!(register_builtin(&mut reg).is_err());
    }

    #[test]
    fn builtin_params_are_declared() {
        let mut reg = TaskRegistry::new();
        register_builtin(&mut reg).unwrap();
        let ping = reg.lookup("http_ping").unwrap();
        assert!(ping.validate_params(&ctx(json!({"url": "https://example.com"})).params).is_ok());
        assert!(ping.validate_params(&ctx(json!({})).params).is_err());
        let sleep = reg.lookup("sleep").unwrap();
        assert!(sleep.validate_params(&ctx(json!({"seconds": "5"})).params).is_err());
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let out = echo(ctx(json!({"message": "hi"}))).await.unwrap();
        assert_eq!(out, json!({"message": "hi"}));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_finishes_or_stops_on_cancel() {
        let out = sleep(ctx(json!({"seconds": 2}))).await.unwrap();
        assert_eq!(out, json!({"slept": 2.0}));

        let c = ctx(json!({"seconds": 60}));
        let cancel = c.cancel.clone();
        let task = tokio::spawn(sleep(c));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn sleep_rejects_negative_seconds() {
        assert!(sleep(ctx(json!({"seconds": -1}))).await.is_err());
    }

    #[tokio::test]
    async fn ping_needs_a_url() {
        assert!(http_ping(ctx(json!({"url": 5}))).await.is_err());
    }
}
