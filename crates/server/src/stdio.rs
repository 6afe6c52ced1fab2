use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::rpc::{self, SharedContext};
use quorum_protocol::envelope::{self, RpcError, RpcRequest, RpcResponse};

/// Run the newline-delimited JSON transport: one request per line on
/// stdin, one response per line on stdout. Malformed lines are answered
/// with a protocol error and the stream continues. Returns on EOF.
pub async fn run(ctx: SharedContext) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(ctx, stdin, stdout).await
}

async fn serve<R, W>(ctx: SharedContext, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => rpc::dispatch(&ctx, request).await,
            Err(e) => Some(RpcResponse::failure(
                serde_json::Value::Null,
                RpcError {
                    code: envelope::PARSE_ERROR,
                    message: format!("invalid JSON: {e}"),
                    data: None,
                },
            )),
        };

        if let Some(response) = response {
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
        }
    }

    tracing::info!("stdin closed, stdio transport exiting");
    Ok(())
}
