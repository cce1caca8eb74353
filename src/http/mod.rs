/// The HTTP side channel: a client whose first four bytes read "GET " is
/// served one HTTP/1.0 response and disconnected.
///
/// `/` renders the shard-and-backend dashboard, `/monitor` a plain-text
/// health summary whose first line is `OK`, `WARNING` or `CRITICAL`.
use crate::error::Result;
use crate::monitor::Level;
use crate::Ctx;
use log::debug;
use std::fmt::Write as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CSS: &str = "<style type='text/css'><!--\n\
body { font-family: sans-serif; }\n\
tr.first td { padding-top: 0.5em; }\n\
td { padding-right: 2em; }\n\
th { text-align: left; }\n\
tr.shard td { padding-top: 1em; padding-bottom: 0.5em; font-size: 120%; font-weight: bold; }\n\
h1 { border-bottom: black 1px solid; }\n\
--></style>";

/// Serves one request. The "GET " prefix has already been consumed by the
/// wire-protocol peek; the stream is positioned at the path.
pub async fn serve<S>(stream: &mut S, ctx: &Ctx) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = read_token(stream).await?;
    debug!("http request for {path}");

    let (status, content_type, body) = dispatch(&path, ctx);

    let mut response = String::new();
    let _ = write!(
        response,
        "HTTP/1.0 {status} \r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn dispatch(path: &str, ctx: &Ctx) -> (&'static str, &'static str, String) {
    match path {
        "/" => ("200", "text/html", show_shards(ctx)),
        "/monitor" => ("200", "text/plain", show_monitor(ctx)),
        _ => ("404", "text/plain", "Not found".to_string()),
    }
}

/// Reads one whitespace-delimited token, skipping leading whitespace.
async fn read_token<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut token = String::new();
    loop {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).await.is_err() {
            break;
        }
        let c = byte[0] as char;
        if c.is_whitespace() {
            if token.is_empty() {
                continue;
            }
            break;
        }
        token.push(c);
        if token.len() > 1024 {
            break;
        }
    }
    Ok(token)
}

fn show_monitor(ctx: &Ctx) -> String {
    let status = ctx.topology.monitor_check();

    let mut out = String::new();
    out.push_str(match status.level() {
        Level::Ok => "OK\n",
        Level::Warning => "WARNING\n",
        Level::Critical => "CRITICAL\n",
    });
    if status.messages().is_empty() {
        out.push_str("OK");
    } else {
        out.push_str(&status.messages().join("; "));
    }
    out.push('\n');
    out
}

fn show_shards(ctx: &Ctx) -> String {
    let mut out = String::new();
    out.push_str("<html><head><title>pasarela shards</title>");
    out.push_str(CSS);
    out.push_str("<body>");

    let status = ctx.topology.monitor_check();
    if !status.messages().is_empty() {
        out.push_str("<h1>Issues</h1><ul>");
        for msg in status.messages() {
            let _ = write!(out, "<li>{msg}</li>");
        }
        out.push_str("</ul>");
    }

    out.push_str(
        "<h1>Shards</h1><table>\
         <tr class='header'>\
         <th class='leftspacer'>&nbsp;</th>\
         <th>Backend</th>\
         <th>Status</th>\
         <th>Lag</th>\
         <th>Address</th>\
         <th>RTT</th></tr>",
    );

    match ctx.topology.get() {
        Ok(snapshot) => {
            for shard in snapshot.shards() {
                let _ = write!(out, "<tr class='shard'><td colspan='5'>{}</td></tr>", shard.id());
                for backend in shard.backends() {
                    let mut first = true;
                    let endpoints = backend.endpoints();
                    if endpoints.is_empty() {
                        let _ = write!(
                            out,
                            "<tr class='first'><td class='leftspacer'>&nbsp;</td>\
                             <td>{}</td><td>unresolved</td><td>&mdash;</td><td></td><td></td></tr>",
                            backend.addr()
                        );
                        continue;
                    }
                    for endpoint in endpoints {
                        if first {
                            let _ = write!(
                                out,
                                "<tr class='first'><td class='leftspacer'>&nbsp;</td>\
                                 <td>{}</td><td>{}</td>",
                                backend.addr(),
                                shard.backend_status(backend)
                            );
                            match shard.replication_lag(backend) {
                                Some(lag) => {
                                    let _ = write!(out, "<td>{} s</td>", lag.as_secs());
                                }
                                None => out.push_str("<td>&mdash;</td>"),
                            }
                            first = false;
                        } else {
                            out.push_str(
                                "<tr><td class='leftspacer'>&nbsp;</td><td></td><td></td><td></td>",
                            );
                        }
                        let _ = write!(out, "<td>{}</td><td>", endpoint.addr());
                        match endpoint.roundtrip() {
                            Some(rtt) => {
                                let _ = write!(out, "{} ms", rtt.as_millis());
                            }
                            None => out.push_str("DEAD"),
                        }
                        out.push_str("</td></tr>");
                    }
                }
            }
        }
        Err(_) => out.push_str("<span style='color: red'>No shard config yet</span>"),
    }

    out.push_str("</table></body></html>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialsCache;
    use crate::core::shard::ShardPool;
    use crate::topology::cache::DiskCache;
    use crate::topology::holder::TopologyHolder;
    use std::sync::Arc;

    fn test_ctx() -> Ctx {
        let pool = Arc::new(ShardPool::new());
        let cache = Arc::new(DiskCache::open(None));
        let topology =
            TopologyHolder::spawn("cfg1:27019,cfg2:27019", pool.clone(), cache.clone()).unwrap();
        Ctx {
            topology,
            credentials: Arc::new(CredentialsCache::new(cache.clone())),
            cache,
            pool,
        }
    }

    #[tokio::test]
    async fn test_monitor_first_line_is_a_level() {
        let ctx = test_ctx();
        let body = show_monitor(&ctx);
        let first = body.lines().next().unwrap();
        assert!(matches!(first, "OK" | "WARNING" | "CRITICAL"));
        // without a topology the router is critical
        assert_eq!(first, "CRITICAL");
        assert!(body.contains("no config available"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let ctx = test_ctx();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        // the "GET " prefix was already consumed by the session peek
        client.write_all(b"/nope HTTP/1.0\r\n\r\n").await.unwrap();
        serve(&mut server, &ctx).await.unwrap();

        let mut response = vec![0u8; 256];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]).to_string();
        assert!(text.starts_with("HTTP/1.0 404"));
        assert!(text.contains("Not found"));
    }

    #[tokio::test]
    async fn test_dashboard_renders_without_topology() {
        let ctx = test_ctx();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        client.write_all(b"/ HTTP/1.0\r\n\r\n").await.unwrap();
        serve(&mut server, &ctx).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(std::time::Duration::from_millis(100), client.read(&mut buf))
                .await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
            }
        }
        let text = String::from_utf8_lossy(&response).to_string();
        assert!(text.starts_with("HTTP/1.0 200"));
        assert!(text.contains("No shard config yet"));
    }
}
