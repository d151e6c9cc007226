//! Greeting service: one trivial procedure per method kind.

use crate::api::{
    Echo, EchoMessage, HelloReply, HelloRequest, MessageReceipt, MessageRequest, NameRequest,
    SayHello, SendMessage, StreamedName,
};
use quadrant_core::{
    DuplexConnection, PushConnection, RequestContext, Result, Service, ServiceImplementation,
};
use std::time::Duration;
use tracing::{debug, info};

/// Pause between letters of `StreamedName` unless configured otherwise.
pub const DEFAULT_STREAM_DELAY: Duration = Duration::from_millis(1000);

pub fn implementation(service: &Service, stream_delay: Duration) -> Result<ServiceImplementation> {
    ServiceImplementation::builder(service)
        .query::<SayHello, _, _>(say_hello)
        .mutation::<SendMessage, _, _>(send_message)
        .subscription::<StreamedName, _, _>(move |input: NameRequest, conn: PushConnection<String>| {
            stream_name(input, conn, stream_delay)
        })
        .bidirectional::<Echo, _, _>(echo)
        .build()
}

async fn say_hello(input: HelloRequest) -> Result<HelloReply> {
    let greeting = input
        .name
        .into_iter()
        .map(|(language, name)| (language, format!("Hello {}", name)))
        .collect();
    Ok(HelloReply { greeting })
}

async fn send_message(input: MessageRequest) -> Result<MessageReceipt> {
    info!("Received message: {}", input.message);
    Ok(MessageReceipt { status: true })
}

/// Write one letter per tick, then end the stream.
async fn stream_name(input: NameRequest, conn: PushConnection<String>, delay: Duration) -> Result<()> {
    for letter in input.name.chars() {
        tokio::time::sleep(delay).await;
        if !conn.is_open() {
            debug!("StreamedName subscriber left after partial delivery");
            return Ok(());
        }
        conn.write(&letter.to_string())?;
    }
    conn.close();
    Ok(())
}

async fn echo(_context: RequestContext, conn: DuplexConnection<EchoMessage, EchoMessage>) -> Result<()> {
    conn.on_close(|| info!("Echo session ended"));
    conn.on_message("Echo", |conn, message: EchoMessage| async move {
        debug!("Echo received: {}", message.msg);
        conn.send(&EchoMessage {
            msg: format!("Echo: {}", message.msg),
        })?;
        conn.close();
        Ok(())
    });
    Ok(())
}
