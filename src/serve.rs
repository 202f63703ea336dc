//! Line-oriented JSON protocol over a Unix socket.
//!
//! The client sends one request as a single JSON line and the server
//! answers on the same connection:
//!
//! - `{"op":"sample","prompt":"...","guidance_scale":3.0,"seed":1}` —
//!   one decimal token per line as tokens are produced. The connection
//!   closing mid-stream cancels the run.
//! - `{"op":"render","tokens":"1,2,3"}` — a JSON status line
//!   (`{"ok":true,"len":N}`) followed by the raw image bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::manager::GenerationManager;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Sample {
        prompt: String,
        #[serde(default)]
        guidance_scale: Option<f64>,
        #[serde(default)]
        seed: Option<u64>,
    },
    Render {
        tokens: String,
    },
}

#[derive(Debug, Serialize)]
struct RenderStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Parse a comma-separated token list.
pub fn parse_token_list(text: &str) -> Result<Vec<u32>> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|_| Error::Request(format!("invalid token {part:?}")))
        })
        .collect()
}

/// Pad a partial token grid to the full size by repeating the last token.
/// An empty list becomes an all-zero grid; too many tokens is an error.
pub fn pad_grid(tokens: &[u32], grid: usize) -> Result<Vec<u32>> {
    if tokens.len() > grid {
        return Err(Error::Request(format!(
            "{} tokens exceed the {grid}-token grid",
            tokens.len()
        )));
    }
    let mut padded = tokens.to_vec();
    padded.resize(grid, tokens.last().copied().unwrap_or(0));
    Ok(padded)
}

/// Serve one client connection: read the request line, dispatch, reply.
pub async fn handle_connection(
    stream: UnixStream,
    manager: Arc<GenerationManager>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let request: Request = serde_json::from_str(line.trim())?;

    match request {
        Request::Sample {
            prompt,
            guidance_scale,
            seed,
        } => {
            tracing::info!(prompt = %prompt, ?guidance_scale, "sample request");
            let mut rx = manager.stream(prompt, guidance_scale, seed);
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(token) => {
                        if writer.write_all(format!("{token}\n").as_bytes()).await.is_err() {
                            // Client hung up; dropping rx cancels the run.
                            tracing::debug!("client disconnected mid-stream");
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "generation failed mid-stream");
                        return Ok(());
                    }
                }
            }
            writer.flush().await?;
        }
        Request::Render { tokens } => {
            let grid = manager.model_config().grid_tokens;
            let outcome = parse_token_list(&tokens)
                .and_then(|tokens| pad_grid(&tokens, grid))
                .and_then(|padded| manager.render(&padded));
            match outcome {
                Ok(bytes) => {
                    let status = RenderStatus {
                        ok: true,
                        len: Some(bytes.len()),
                        error: None,
                    };
                    writer
                        .write_all(format!("{}\n", serde_json::to_string(&status)?).as_bytes())
                        .await?;
                    writer.write_all(&bytes).await?;
                }
                Err(e) => {
                    let status = RenderStatus {
                        ok: false,
                        len: None,
                        error: Some(e.to_string()),
                    };
                    writer
                        .write_all(format!("{}\n", serde_json::to_string(&status)?).as_bytes())
                        .await?;
                }
            }
            writer.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::decoder::testing::EchoDecoder;
    use crate::model::Transformer;
    use crate::ModelConfig;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn parses_token_lists() {
        assert_eq!(parse_token_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_token_list("").unwrap(), Vec::<u32>::new());
        assert!(matches!(
            parse_token_list("1,x,3"),
            Err(Error::Request(_))
        ));
        assert!(matches!(
            parse_token_list("1,-2"),
            Err(Error::Request(_))
        ));
    }

    #[test]
    fn pads_by_repeating_the_last_token() {
        assert_eq!(pad_grid(&[7, 9], 4).unwrap(), vec![7, 9, 9, 9]);
        assert_eq!(pad_grid(&[], 3).unwrap(), vec![0, 0, 0]);
        assert_eq!(pad_grid(&[1, 2, 3], 3).unwrap(), vec![1, 2, 3]);
        assert!(matches!(pad_grid(&[1; 5], 4), Err(Error::Request(_))));
    }

    fn tiny_manager() -> Arc<GenerationManager> {
        let config = ModelConfig {
            codebook_size: 8,
            caption_bytes: 4,
            grid_tokens: 6,
            layer_count: 1,
            model_dim: 8,
            head_dim: 4,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Transformer::new(&config, vb).unwrap();
        Arc::new(
            GenerationManager::from_model(model, Device::Cpu)
                .with_decoder(Arc::new(EchoDecoder { grid: 6 })),
        )
    }

    #[tokio::test]
    async fn sample_request_streams_token_lines() {
        let manager = tiny_manager();
        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_connection(server, manager));

        let (reader, mut writer) = client.into_split();
        writer
            .write_all(b"{\"op\":\"sample\",\"prompt\":\"hi\",\"seed\":1}\n")
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut lines = BufReader::new(reader).lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await.unwrap() {
            line.parse::<u32>().unwrap();
            count += 1;
        }
        assert_eq!(count, 6);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_closes_without_tokens() {
        let manager = tiny_manager();
        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_connection(server, manager));

        let (mut reader, mut writer) = client.into_split();
        // No prompt field: the request must be rejected before any
        // generation starts.
        writer
            .write_all(b"{\"op\":\"sample\"}\n")
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data)
            .await
            .unwrap();
        assert!(data.is_empty());
        assert!(matches!(task.await.unwrap(), Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn render_request_returns_bytes() {
        let manager = tiny_manager();
        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_connection(server, manager));

        let (reader, mut writer) = client.into_split();
        writer
            .write_all(b"{\"op\":\"render\",\"tokens\":\"1,2\"}\n")
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = BufReader::new(reader);
        let mut status = String::new();
        reader.read_line(&mut status).await.unwrap();
        assert!(status.contains("\"ok\":true"));
        assert!(status.contains("\"len\":12"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_render_reports_an_error() {
        let manager = tiny_manager();
        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_connection(server, manager));

        let (reader, mut writer) = client.into_split();
        writer
            .write_all(b"{\"op\":\"render\",\"tokens\":\"1,2,3,4,5,6,7\"}\n")
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = BufReader::new(reader);
        let mut status = String::new();
        reader.read_line(&mut status).await.unwrap();
        assert!(status.contains("\"ok\":false"));
        task.await.unwrap().unwrap();
    }
}
