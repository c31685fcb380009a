use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{read_message, write_message, Message, WireError},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;

    write_message(&mut writer, &Message::Register { user: args.name.clone() })
        .await
        .context("failed to register with server")?;
    write_stdout(&format!("*** connected as {}", args.name)).await?;

    let mut session = Session::new();
    let mut inbox = spawn_reader(reader);
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut session, &mut inbox, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Client-side view of the conversation: just the channel this client last
/// joined, stamped onto outgoing chat lines.
struct Session {
    channel: Option<String>,
}

impl Session {
    fn new() -> Self {
        Self { channel: None }
    }
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(stream.into_split())
}

/// Decodes server frames on a dedicated task and forwards them over a
/// channel. The select loop must only ever race cancel-safe receives: a
/// frame read cancelled mid-payload would drop bytes already consumed and
/// desync the length-prefixed stream for good.
fn spawn_reader<R>(mut reader: R) -> mpsc::UnboundedReceiver<Result<Message, WireError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).is_err() {
                        break;
                    }
                }
                // Clean disconnect; dropping the sender closes the inbox.
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    break;
                }
            }
        }
    });
    rx
}

async fn run_client_loop(
    session: &mut Session,
    inbox: &mut mpsc::UnboundedReceiver<Result<Message, WireError>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = inbox.recv() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, session, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(message: Option<Result<Message, WireError>>) -> Result<bool> {
    match message {
        Some(message) => {
            let message = message.context("failed to read from server")?;
            render_server_message(message).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &mut Session,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let line = input.trim_end();
    if line.is_empty() {
        return Ok(true);
    }

    if line.eq_ignore_ascii_case("/quit") || line.eq_ignore_ascii_case("exit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(channel) = line.strip_prefix("/join ") {
        let channel = channel.trim();
        if channel.is_empty() {
            write_stdout("*** usage: /join <channel>").await?;
            return Ok(true);
        }
        write_message(writer, &Message::Join { channel: channel.to_string() }).await?;
        session.channel = Some(channel.to_string());
        write_stdout(&format!("*** joined {channel}")).await?;
        return Ok(true);
    }

    write_message(writer, &Message::text(line, session.channel.clone())).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_server_message(message: Message) -> io::Result<()> {
    match message {
        Message::Text { message, channel: Some(channel), .. } => {
            write_stdout(&format!("[{channel}] {message}")).await
        }
        Message::Text { message, channel: None, .. } => write_stdout(&message).await,
        // The server only ever forwards chat lines; anything else is noise.
        other => {
            debug!(?other, "ignoring non-text message from server");
            Ok(())
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
