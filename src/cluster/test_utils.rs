use salvo::affix_state;
use salvo::prelude::*;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tokio::task::JoinHandle;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

/// Picks a loopback address nobody listens on right now.
pub fn free_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Picks a base port with `span` consecutive free ports after it.
pub fn free_base_port(span: u16) -> u16 {
    loop {
        let base = free_addr().port();
        if base.checked_add(span).is_none() {
            continue;
        }
        let all_free = (0..span)
            .all(|offset| StdTcpListener::bind(("127.0.0.1", base + offset)).is_ok());
        if all_free {
            return base;
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ServedStatus {
    Ok,
    Unavailable,
}

#[derive(Clone)]
struct KeysBody {
    status: StatusCode,
    body: String,
}

#[derive(Clone)]
struct RevokeExec(PathBuf);

#[handler]
async fn stats_ok(res: &mut Response) {
    res.render(Text::Json(r#"{"name":"node-0","state":"StateLeader"}"#));
}

#[handler]
async fn stats_unavailable(res: &mut Response) {
    res.status_code(StatusCode::SERVICE_UNAVAILABLE);
    res.render(Text::Plain("starting"));
}

#[handler]
async fn stats_revoking_exec(depot: &mut Depot, res: &mut Response) {
    if let Ok(RevokeExec(path)) = depot.obtain::<RevokeExec>() {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644));
    }
    res.render(Text::Json(r#"{"name":"node-0","state":"StateLeader"}"#));
}

#[handler]
async fn keys_handler(depot: &mut Depot, res: &mut Response) {
    if let Ok(served) = depot.obtain::<KeysBody>() {
        res.status_code(served.status);
        res.render(Text::Json(served.body.clone()));
    }
}

pub async fn serve(addr: SocketAddr, router: Router) -> JoinHandle<()> {
    let acceptor = TcpListener::new(addr).bind().await;
    tokio::spawn(async move {
        Server::new(acceptor).serve(router).await;
    })
}

/// Serves `/v2/stats/self` and an absent `flood` namespace, like a fresh etcd node.
pub async fn serve_status(addr: SocketAddr, status: ServedStatus) -> JoinHandle<()> {
    let stats = match status {
        ServedStatus::Ok => Router::with_path("v2/stats/self").get(stats_ok),
        ServedStatus::Unavailable => Router::with_path("v2/stats/self").get(stats_unavailable),
    };
    let router = Router::new()
        .hoop(affix_state::inject(KeysBody {
            status: StatusCode::NOT_FOUND,
            body: r#"{"errorCode":100,"message":"Key not found","cause":"/flood","index":3}"#
                .to_string(),
        }))
        .push(stats)
        .push(Router::with_path("v2/keys/flood").get(keys_handler));
    serve(addr, router).await
}

/// Serves a live status endpoint that strips the exec bit from `binary` on its first hit.
pub async fn serve_status_revoking_exec(addr: SocketAddr, binary: &Path) -> JoinHandle<()> {
    let router = Router::new()
        .hoop(affix_state::inject(RevokeExec(binary.to_path_buf())))
        .push(Router::with_path("v2/stats/self").get(stats_revoking_exec));
    serve(addr, router).await
}

/// Serves `body` with `status` at `/v2/keys/flood`.
pub async fn serve_keys(addr: SocketAddr, status: StatusCode, body: &str) -> JoinHandle<()> {
    let router = Router::new()
        .hoop(affix_state::inject(KeysBody {
            status,
            body: body.to_string(),
        }))
        .push(Router::with_path("v2/stats/self").get(stats_ok))
        .push(Router::with_path("v2/keys/flood").get(keys_handler));
    serve(addr, router).await
}

/// Writes a shell script standing in for the etcd binary. It echoes its arguments and sleeps.
pub fn fake_etcd(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join("etcd");
    std::fs::write(&path, "#!/bin/sh\necho \"fake etcd $*\"\nexec sleep 60\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
