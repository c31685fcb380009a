use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const SILENCE: Duration = Duration::from_millis(500);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat_relay");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    // Foo settles into the registry first: its own echo proves the server
    // accepted the connection before anyone else starts talking.
    let mut foo = spawn_client(&binary, "foo", &addr).await?;
    foo.send_line("knock knock").await.context("foo probe")?;
    let foo_probe = read_line_expect(&mut foo.stdout, "waiting for foo echo").await?;
    assert_eq!(foo_probe, "knock knock");

    let mut bar = spawn_client(&binary, "bar", &addr).await?;
    bar.send_line("Hello from bar").await.context("bar greets")?;
    let bar_echo = read_line_expect(&mut bar.stdout, "waiting for bar echo").await?;
    assert_eq!(bar_echo, "Hello from bar");
    let foo_hears_bar = read_line_expect(&mut foo.stdout, "waiting for foo to hear bar").await?;
    assert_eq!(foo_hears_bar, "Hello from bar");

    // Foo replies and both clients see it, including foo's self-echo.
    foo.send_line("Hi bar!").await.context("foo replies")?;
    let bar_hears_foo = read_line_expect(&mut bar.stdout, "waiting for bar to hear foo").await?;
    assert_eq!(bar_hears_foo, "Hi bar!");
    let foo_echo = read_line_expect(&mut foo.stdout, "waiting for foo echo").await?;
    assert_eq!(foo_echo, "Hi bar!");

    // Foo moves to another channel; bar must not see foo's next line.
    foo.send_line("/join cd").await.context("foo joins cd")?;
    let joined = read_line_expect(&mut foo.stdout, "waiting for join confirmation").await?;
    assert_eq!(joined, "*** joined cd");
    foo.send_line("no one is here...").await.context("foo talks to cd")?;
    let foo_cd_echo = read_line_expect(&mut foo.stdout, "waiting for foo cd echo").await?;
    assert_eq!(foo_cd_echo, "[cd] no one is here...");
    assert_no_line(&mut bar.stdout, "bar must not hear channel cd").await?;

    // Both clients quit cleanly.
    foo.send_line("/quit").await.context("foo quits")?;
    let foo_quit = read_line_expect(&mut foo.stdout, "waiting for foo quit confirmation").await?;
    assert_eq!(foo_quit, "*** leaving chat");
    bar.send_line("exit").await.context("bar quits")?;
    let bar_quit = read_line_expect(&mut bar.stdout, "waiting for bar quit confirmation").await?;
    assert_eq!(bar_quit, "*** leaving chat");

    ensure_success(&mut foo.child, "foo client").await?;
    ensure_success(&mut bar.child, "bar client").await?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, name: &str, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for connect banner").await?;
    if banner != format!("*** connected as {name}") {
        return Err(anyhow!("expected connect banner for {name}, got '{banner}'"));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn assert_no_line(reader: &mut BufReader<ChildStdout>, description: &str) -> Result<()> {
    let mut line = String::new();
    match timeout(SILENCE, reader.read_line(&mut line)).await {
        Err(_) => Ok(()),
        Ok(Ok(0)) => Err(anyhow!("{description}: stream closed")),
        Ok(Ok(_)) => Err(anyhow!("{description}: got '{}'", line.trim_end())),
        Ok(Err(err)) => Err(anyhow!("{description}: read failed: {err}")),
    }
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
