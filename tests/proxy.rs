//! End-to-end proxy sessions over in-memory streams.
//!
//! The downstream side is driven with `ClientConn`, the upstream side is a
//! scripted ClickHouse built from `ServerConn`, so every byte crosses the
//! real codec twice.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use clickhouse_proxy::batcher::{BatcherConfig, BatcherPool};
use clickhouse_proxy::conn::{ClientConn, ServerConn};
use clickhouse_proxy::error::{Error, Result};
use clickhouse_proxy::pool::{apply_credentials, Client, ClientOption, ClientPool};
use clickhouse_proxy::protocol::{ClientPacket, ServerPacket};
use clickhouse_proxy::proxy::Proxy;
use clickhouse_proxy::wire::{
    default_credentials, Block, Column, Exception, ProfileInfo, Progress, Query, QueryMeta, Ver,
};

#[derive(Debug, Clone)]
enum Event {
    Query(String),
    Block(Block),
    Cancel,
}

type Events = Arc<Mutex<Vec<Event>>>;

#[derive(Clone)]
enum Script {
    /// Respond to a read query with these blocks, then EndOfStream.
    Blocks(Vec<Block>),
    /// Respond with progress, one block, profile info, then EndOfStream.
    Counters {
        progress: Progress,
        profile: ProfileInfo,
        block: Block,
    },
    /// Send the meta, then fail the query.
    Exception(Exception),
    /// Fail the query before any meta is declared.
    ExceptionAtQuery(Exception),
}

/// One scripted upstream "ClickHouse" per pooled connection.
async fn fake_upstream(stream: DuplexStream, meta: QueryMeta, script: Script, events: Events) {
    let mut sc = ServerConn::new(stream);
    if sc.hello().await.is_err() {
        return;
    }

    loop {
        let tp = match sc.next_packet().await {
            Ok(tp) => tp,
            Err(_) => return,
        };

        match tp {
            ClientPacket::Ping => sc.send_pong().await.unwrap(),
            ClientPacket::Query => {
                let q = sc.recv_query().await.unwrap();
                events.lock().unwrap().push(Event::Query(q.sql.clone()));

                if let Script::ExceptionAtQuery(exc) = &script {
                    sc.send_exception(exc).await.unwrap();
                    continue;
                }

                sc.send_query_meta(&meta, q.compressed).await.unwrap();

                if q.is_insert() {
                    loop {
                        match sc.next_packet().await.unwrap() {
                            ClientPacket::Data => {
                                let b = sc.recv_block(q.compressed).await.unwrap();
                                let done = b.is_empty();
                                events.lock().unwrap().push(Event::Block(b));
                                if done {
                                    sc.send_end_of_stream().await.unwrap();
                                    break;
                                }
                            }
                            ClientPacket::Cancel => {
                                events.lock().unwrap().push(Event::Cancel);
                                sc.send_end_of_stream().await.unwrap();
                                break;
                            }
                            p => panic!("unexpected insert packet: {p:?}"),
                        }
                    }
                    continue;
                }

                match &script {
                    Script::Blocks(blocks) => {
                        for b in blocks {
                            sc.send_block(b, q.compressed).await.unwrap();
                        }
                        sc.send_end_of_stream().await.unwrap();
                    }
                    Script::Counters {
                        progress,
                        profile,
                        block,
                    } => {
                        sc.send_progress(progress).await.unwrap();
                        sc.send_block(block, q.compressed).await.unwrap();
                        sc.send_profile_info(profile).await.unwrap();
                        sc.send_end_of_stream().await.unwrap();
                    }
                    Script::Exception(exc) => {
                        sc.send_exception(exc).await.unwrap();
                    }
                    Script::ExceptionAtQuery(_) => unreachable!(),
                }
            }
            p => panic!("unexpected packet: {p:?}"),
        }
    }
}

/// Pool that "dials" a fresh scripted upstream per get.
struct DuplexPool {
    meta: QueryMeta,
    script: Script,
    events: Events,
}

impl DuplexPool {
    fn new(meta: QueryMeta, script: Script) -> Self {
        DuplexPool {
            meta,
            script,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ClientPool for DuplexPool {
    async fn get(&self, opts: &[ClientOption]) -> Result<Box<dyn Client>> {
        let (local, remote) = tokio::io::duplex(1 << 20);
        tokio::spawn(fake_upstream(
            remote,
            self.meta.clone(),
            self.script.clone(),
            self.events.clone(),
        ));

        let mut client = ClientConn::new(local);
        client.credentials = apply_credentials(default_credentials(), opts);
        client.hello().await?;
        Ok(Box::new(client))
    }

    async fn put(&self, client: Box<dyn Client>, _err: Option<&Error>) -> Result<()> {
        drop(client);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn meta_u8() -> QueryMeta {
    vec![Column {
        name: "x".into(),
        ty: "UInt8".into(),
        raw: Vec::new(),
    }]
}

fn meta_u32() -> QueryMeta {
    vec![Column {
        name: "a".into(),
        ty: "UInt32".into(),
        raw: Vec::new(),
    }]
}

fn block_u8(name: &str, values: &[u8]) -> Block {
    Block {
        table: String::new(),
        rows: values.len() as u64,
        cols: vec![Column {
            name: name.into(),
            ty: "UInt8".into(),
            raw: values.to_vec(),
        }],
    }
}

fn block_u32(values: &[u32]) -> Block {
    Block {
        table: String::new(),
        rows: values.len() as u64,
        cols: vec![Column {
            name: "a".into(),
            ty: "UInt32".into(),
            raw: values.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }],
    }
}

/// Spawn a proxy session over a duplex pipe and return the connected
/// downstream driver.
async fn start_session(proxy: Proxy) -> ClientConn<DuplexStream> {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);

    tokio::spawn(async move {
        let _ = proxy
            .handle_conn(server_end, "test".into(), CancellationToken::new())
            .await;
    });

    let mut cc = ClientConn::new(client_end);
    cc.hello().await.unwrap();
    cc
}

fn data_blocks(events: &Events) -> Vec<Block> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Block(b) if !b.is_empty() => Some(b.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn transparent_select_forwards_meta_block_and_eos() {
    let upstream_block = block_u8("x", &(0..10).collect::<Vec<_>>());
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![upstream_block.clone()]));
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;

    let meta = cc.send_query(&Query::new("SELECT x FROM t")).await.unwrap();
    assert_eq!(meta, meta_u8());

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Data);
    let got = cc.recv_block(false).await.unwrap();
    assert_eq!(got, upstream_block);

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}

#[tokio::test]
async fn select_one_returns_single_row() {
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![block_u8("1", &[1])]));
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;

    cc.send_query(&Query::new("SELECT 1")).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Data);

    let b = cc.recv_block(false).await.unwrap();
    assert_eq!(b.rows, 1);
    assert_eq!(b.cols[0].raw, vec![1]);

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}

#[tokio::test]
async fn compressed_select_round_trips_block_payloads() {
    let upstream_block = block_u32(&(0..1000).collect::<Vec<_>>());
    let pool = DuplexPool::new(meta_u32(), Script::Blocks(vec![upstream_block.clone()]));
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;

    let q = Query {
        compressed: true,
        ..Query::new("SELECT a FROM t")
    };
    cc.send_query(&q).await.unwrap();

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Data);
    let got = cc.recv_block(true).await.unwrap();
    assert_eq!(got, upstream_block);

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}

#[tokio::test]
async fn progress_and_profile_info_are_forwarded() {
    let progress = Progress {
        rows: 10,
        bytes: 420,
        total_rows: 100,
    };
    let profile = ProfileInfo {
        rows: 10,
        blocks: 1,
        bytes: 420,
        applied_limit: 0,
        rows_before_limit: 10,
        calc_rows_before_limit: 1,
    };
    let pool = DuplexPool::new(
        meta_u8(),
        Script::Counters {
            progress,
            profile,
            block: block_u8("x", &[7]),
        },
    );
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;
    cc.send_query(&Query::new("SELECT x FROM t")).await.unwrap();

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Progress);
    assert_eq!(cc.recv_progress().await.unwrap(), progress);

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Data);
    cc.recv_block(false).await.unwrap();

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::ProfileInfo);
    assert_eq!(cc.recv_profile_info().await.unwrap(), profile);

    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}

#[tokio::test]
async fn transparent_insert_forwards_blocks_upstream() {
    let pool = Arc::new(DuplexPool::new(meta_u32(), Script::Blocks(vec![])));
    let events = pool.events.clone();
    let proxy = Proxy::new(pool);

    let mut cc = start_session(proxy).await;

    let q = Query::new("INSERT INTO t (a) VALUES");
    let meta = cc.send_query(&q).await.unwrap();
    assert_eq!(meta, meta_u32());

    cc.send_block(&block_u32(&[1, 2, 3]), false).await.unwrap();
    cc.send_block(&Block::default(), false).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);

    let blocks = data_blocks(&events);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].rows, 3);
}

#[tokio::test]
async fn cancel_mid_insert_reaches_upstream_once() {
    let pool = Arc::new(DuplexPool::new(meta_u32(), Script::Blocks(vec![])));
    let events = pool.events.clone();
    let proxy = Proxy::new(pool);

    let mut cc = start_session(proxy).await;

    let q = Query::new("INSERT INTO t (a) VALUES");
    cc.send_query(&q).await.unwrap();
    cc.send_block(&block_u32(&[1, 2, 3]), false).await.unwrap();
    cc.cancel_query().await.unwrap();

    // a follow-up query proves the session survived
    cc.send_query(&Query::new("SELECT a FROM t")).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);

    // the scripted upstream records the cancel on its own task
    tokio::time::timeout(Duration::from_secs(5), async {
        while !events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Cancel))
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("upstream never saw the cancel");

    let recorded = events.lock().unwrap().clone();
    let cancels = recorded
        .iter()
        .filter(|e| matches!(e, Event::Cancel))
        .count();
    assert_eq!(cancels, 1, "exactly one upstream cancel");

    let cancel_at = recorded
        .iter()
        .position(|e| matches!(e, Event::Cancel))
        .unwrap();
    assert!(
        !recorded[cancel_at..]
            .iter()
            .any(|e| matches!(e, Event::Block(_))),
        "no upstream block writes after the cancel"
    );
}

#[tokio::test]
async fn exception_after_meta_is_forwarded_and_session_survives() {
    let exc = Exception {
        code: 60,
        name: "DB::Exception".into(),
        message: "Table default.missing does not exist".into(),
        stack_trace: String::new(),
        cause: Some(Box::new(Exception {
            code: 1,
            name: "inner".into(),
            message: "root cause".into(),
            ..Default::default()
        })),
    };
    let pool = DuplexPool::new(meta_u8(), Script::Exception(exc.clone()));
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;

    cc.send_query(&Query::new("SELECT x FROM missing")).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Exception);
    let got = cc.recv_exception().await.unwrap();
    assert_eq!(got, exc);

    // same session, next request still works
    let meta = cc.send_query(&Query::new("SELECT x FROM t")).await.unwrap();
    assert_eq!(meta, meta_u8());
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Exception);
    cc.recv_exception().await.unwrap();
}

#[tokio::test]
async fn exception_at_query_time_is_forwarded() {
    let exc = Exception {
        code: 81,
        name: "DB::Exception".into(),
        message: "Database nope does not exist".into(),
        ..Default::default()
    };
    let pool = DuplexPool::new(meta_u8(), Script::ExceptionAtQuery(exc.clone()));
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;

    let err = cc.send_query(&Query::new("SELECT 1")).await.unwrap_err();
    match err {
        Error::Server(got) => assert_eq!(got, exc),
        other => panic!("expected server exception, got {other:?}"),
    }

    // the proxy kept the session; a retry reaches upstream again
    let err = cc.send_query(&Query::new("SELECT 2")).await.unwrap_err();
    assert!(matches!(err, Error::Server(_)));
}

#[tokio::test]
async fn insert_via_batcher_acks_immediately_and_flushes_merged() {
    let inner = Arc::new(DuplexPool::new(meta_u32(), Script::Blocks(vec![])));
    let events = inner.events.clone();

    let cfg = BatcherConfig {
        max_rows: u64::MAX,
        max_bytes: u64::MAX,
        max_interval: Duration::from_secs(3600),
        tick_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let batcher = BatcherPool::new(inner, cfg);
    let proxy = Proxy::new(Arc::new(batcher.clone()));

    let mut cc = start_session(proxy).await;

    let q = Query::new("INSERT INTO t (a) VALUES");
    let meta = cc.send_query(&q).await.unwrap();
    assert_eq!(meta, meta_u32());

    cc.send_block(&block_u32(&[1, 2, 3]), false).await.unwrap();
    cc.send_block(&block_u32(&[4, 5]), false).await.unwrap();
    cc.send_block(&Block::default(), false).await.unwrap();

    // acknowledged before anything is flushed upstream
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
    assert!(data_blocks(&events).is_empty());

    batcher.close().await.unwrap();

    let blocks = data_blocks(&events);
    assert_eq!(blocks.len(), 1, "one merged upstream insert");
    assert_eq!(blocks[0].rows, 5);
    assert_eq!(
        blocks[0].cols[0].raw,
        (1u32..=5).flat_map(|x| x.to_le_bytes()).collect::<Vec<_>>()
    );

    // the merged block is followed by the end-of-insert sentinel
    let recorded = events.lock().unwrap().clone();
    let at = recorded
        .iter()
        .position(|e| matches!(e, Event::Block(b) if !b.is_empty()))
        .unwrap();
    assert!(matches!(&recorded[at + 1], Event::Block(b) if b.is_empty()));
}

#[tokio::test]
async fn concurrent_sessions_interleave_into_one_batch() {
    let inner = Arc::new(DuplexPool::new(meta_u32(), Script::Blocks(vec![])));
    let events = inner.events.clone();

    let cfg = BatcherConfig {
        max_rows: u64::MAX,
        max_bytes: u64::MAX,
        max_interval: Duration::from_secs(3600),
        tick_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let batcher = BatcherPool::new(inner, cfg);
    let proxy = Proxy::new(Arc::new(batcher.clone()));

    let sql = "INSERT INTO t (a) VALUES";

    let mut a = start_session(proxy.clone()).await;
    let mut b = start_session(proxy).await;

    a.send_query(&Query::new(sql)).await.unwrap();
    b.send_query(&Query::new(sql)).await.unwrap();

    a.send_block(&block_u32(&[1, 2, 3]), false).await.unwrap();
    b.send_block(&block_u32(&[4, 5]), false).await.unwrap();

    a.send_block(&Block::default(), false).await.unwrap();
    assert_eq!(a.next_packet().await.unwrap(), ServerPacket::EndOfStream);

    b.send_block(&Block::default(), false).await.unwrap();
    assert_eq!(b.next_packet().await.unwrap(), ServerPacket::EndOfStream);

    batcher.close().await.unwrap();

    let blocks = data_blocks(&events);
    assert_eq!(blocks.len(), 1, "both sessions share one flush");
    assert_eq!(blocks[0].rows, 5);
}

#[tokio::test]
async fn old_server_revision_gets_no_timezone_field() {
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![]));
    let mut proxy = Proxy::new(Arc::new(pool));
    proxy.server.ver = Ver {
        major: 1,
        minor: 1,
        revision: 54000,
    };

    let mut cc = start_session(proxy).await;
    assert_eq!(cc.server.ver.revision, 54000);
    assert!(
        cc.timezone.is_empty(),
        "timezone must not appear on the wire below revision 54058"
    );

    // the wire stayed aligned: a full request round-trips
    cc.send_query(&Query::new("SELECT x FROM t")).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}

#[tokio::test]
async fn old_client_revision_gets_no_timezone_field() {
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![]));
    let proxy = Proxy::new(Arc::new(pool));

    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let _ = proxy
            .handle_conn(server_end, "test".into(), CancellationToken::new())
            .await;
    });

    let mut cc = ClientConn::new(client_end);
    cc.client.ver = Ver {
        major: 1,
        minor: 1,
        revision: 54000,
    };
    cc.hello().await.unwrap();
    assert!(cc.timezone.is_empty());

    // quota key is below its gate too; the request must still line up
    cc.send_query(&Query::new("SELECT x FROM t")).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}

#[tokio::test]
async fn modern_client_receives_timezone() {
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![]));
    let proxy = Proxy::new(Arc::new(pool));

    let cc = start_session(proxy).await;
    assert_eq!(cc.timezone, "UTC");
}

#[tokio::test]
async fn auth_hook_rejects_with_an_exception() {
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![]));
    let mut proxy = Proxy::new(Arc::new(pool));
    proxy.auth = Some(Arc::new(|creds| {
        if creds.user == "default" {
            Ok(())
        } else {
            Err(Error::Auth(format!("unknown user {:?}", creds.user)))
        }
    }));

    // good credentials pass
    let _cc = start_session(proxy.clone()).await;

    // bad credentials get an exception instead of a server hello
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let _ = proxy
            .handle_conn(server_end, "test".into(), CancellationToken::new())
            .await;
    });

    let mut cc = ClientConn::new(client_end);
    cc.credentials.user = "intruder".into();
    let err = cc.hello().await.unwrap_err();
    match err {
        Error::Server(exc) => {
            assert_eq!(exc.code, -1);
            assert!(exc.message.contains("intruder"));
        }
        other => panic!("expected exception, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_between_queries_gets_pong() {
    let pool = DuplexPool::new(meta_u8(), Script::Blocks(vec![]));
    let proxy = Proxy::new(Arc::new(pool));

    let mut cc = start_session(proxy).await;

    cc.send_ping().await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::Pong);

    cc.send_query(&Query::new("SELECT x FROM t")).await.unwrap();
    assert_eq!(cc.next_packet().await.unwrap(), ServerPacket::EndOfStream);
}
