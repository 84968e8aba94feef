use std::{borrow::Cow, io, pin::pin};

use comms::msg::{Event, Msg};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};

use crate::{controller::Controller, outbox::OutMsg};

/// Outbound queue depth per connection. Overflow drops frames first.
const OUTBOX_CAPACITY: usize = 64;

/// The single-client TCP acceptor.
///
/// One peer is served at a time; while a session is live, additional
/// peers are refused with an error frame instead of queueing behind an
/// in-use studio.
pub struct Acceptor {
    listener: TcpListener,
    controller: Controller,
}

impl Acceptor {
    pub async fn bind(addr: &str, controller: Controller) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening at {addr}");

        Ok(Self {
            listener,
            controller,
        })
    }

    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            info!("peer connected from {addr}");

            let (rx, tx) = stream.into_split();
            let mut serve = pin!(serve_peer(&self.controller, rx, tx));

            let result = loop {
                tokio::select! {
                    result = &mut serve => break result,
                    extra = self.listener.accept() => {
                        if let Ok((stream, addr)) = extra {
                            refuse(stream, addr).await;
                        }
                    }
                }
            };

            if let Err(err) = result {
                warn!("session from {addr} ended with error: {err}");
            }
        }
    }
}

/// Tells an extra peer the studio is taken and hangs up.
async fn refuse(stream: TcpStream, addr: std::net::SocketAddr) {
    info!("refusing extra peer from {addr}");

    let (rx, tx) = stream.into_split();
    let (_, mut sender) = comms::channel(rx, tx);
    let msg = Msg::Err(Cow::Borrowed("another client is already connected"));
    if let Err(err) = sender.send(&msg).await {
        debug!("refusal to {addr} failed: {err}");
    }
}

/// Serves one authenticated peer until it disconnects.
///
/// The handshake is strict: the first frame must be a command batch
/// whose connect tag carries the pre-shared token, otherwise the peer
/// gets a single error frame and the socket closes. After the
/// handshake the full state snapshot goes out before the outbox is
/// attached, so no event can ever precede it.
pub async fn serve_peer<R, W>(controller: &Controller, rx: R, tx: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mut receiver, mut sender) = comms::channel(rx, tx);
    let mut buf = Vec::new();

    let first: Msg = receiver.recv_into(&mut buf).await?;
    let Msg::Command(mut batch) = first else {
        let msg = Msg::Err(Cow::Borrowed("expected a connect command"));
        sender.send(&msg).await?;
        return Ok(());
    };

    let authorized = batch
        .connect
        .take()
        .is_some_and(|connect| controller.authorize(&connect.token));
    if !authorized {
        warn!("peer rejected, bad or missing token");
        let msg = Msg::Err(Cow::Borrowed("invalid token"));
        sender.send(&msg).await?;
        return Ok(());
    }

    let snapshot = controller.on_connect();
    sender.send(&Msg::Event(Event::Snapshot(snapshot))).await?;
    sender
        .send(&Msg::Event(Event::Connection { connected: true }))
        .await?;

    let mut queue = controller.outbox().attach(OUTBOX_CAPACITY);

    // the writer task owns the sender, so loop output and events never
    // interleave with a partially written frame
    let mut writer = tokio::spawn(async move {
        while let Some(out) = queue.recv().await {
            let result = match out {
                OutMsg::Event(event) => sender.send(&Msg::Event(event)).await,
                OutMsg::Frame { update_time, data } => {
                    let msg = Msg::Frame {
                        update_time,
                        data: &data,
                    };
                    sender.send(&msg).await
                }
            };

            if let Err(err) = result {
                debug!("writer stopping: {err}");
                break;
            }
        }
    });

    // the connect frame may carry more tags than the handshake
    controller.dispatch(batch);

    // a dead writer means the client can no longer see results, so a
    // send failure tears the whole session down, not just the outbound
    // half
    let result = loop {
        tokio::select! {
            _ = &mut writer => break Ok(()),
            msg = receiver.recv_into(&mut buf) => match msg {
                Ok(Msg::Command(batch)) => controller.dispatch(batch),
                Ok(other) => debug!("ignoring non-command frame: {other:?}"),
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(err) => break Err(err),
            },
        }
    };

    writer.abort();
    controller.outbox().detach();
    controller.on_disconnect();
    result
}
