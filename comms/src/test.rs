#![cfg(test)]

use std::borrow::Cow;

use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};

use crate::{
    StudioReceiver, StudioSender,
    msg::{CommandBatch, Event, Msg, Scope},
};

type Chan = (
    StudioReceiver<ReadHalf<DuplexStream>>,
    StudioSender<WriteHalf<DuplexStream>>,
);

fn channel_pair() -> (Chan, Chan) {
    let (stream1, stream2) = io::duplex(4096);
    let (rx1, tx1) = io::split(stream1);
    let (rx2, tx2) = io::split(stream2);
    (crate::channel(rx1, tx1), crate::channel(rx2, tx2))
}

#[tokio::test]
async fn messages_arrive_in_send_order() -> io::Result<()> {
    let ((mut rx, _), (_, mut tx)) = channel_pair();

    let mut batch = CommandBatch::default();
    batch.training_start = Some(true);
    tx.send(&Msg::Command(batch)).await?;

    let event = Event::Error {
        scope: Scope::Trainer,
        message: "no dataset".into(),
    };
    tx.send(&Msg::Event(event)).await?;
    tx.send(&Msg::Err(Cow::Borrowed("goodbye"))).await?;

    let mut buf = Vec::new();
    assert!(matches!(rx.recv_into::<Msg>(&mut buf).await?, Msg::Command(_)));
    assert!(matches!(rx.recv_into::<Msg>(&mut buf).await?, Msg::Event(_)));

    let Msg::Err(detail) = rx.recv_into::<Msg>(&mut buf).await? else {
        panic!("expected err frame");
    };
    assert_eq!(detail, "goodbye");

    Ok(())
}

#[tokio::test]
async fn large_frame_survives_framing() -> io::Result<()> {
    let ((mut rx, _), (_, mut tx)) = channel_pair();

    let pixels: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let sender = async {
        tx.send(&Msg::Frame {
            update_time: 0.016,
            data: &pixels,
        })
        .await
    };

    let mut buf = Vec::new();
    let receiver = rx.recv_into::<Msg>(&mut buf);

    let (sent, received) = tokio::join!(sender, receiver);
    sent?;

    let Msg::Frame { data, .. } = received? else {
        panic!("expected frame");
    };
    assert_eq!(data.len(), 100_000);
    assert_eq!(data[250], 250);

    Ok(())
}
