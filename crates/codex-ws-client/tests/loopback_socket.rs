use std::time::Duration;

use codex_ws_client::frame::encode_frame;
use codex_ws_client::{
    Frame, FrameReader, Message, encode_client_frame, open_stream, parse_endpoint,
    parse_incoming, perform_handshake,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn upgrade_then_exchange_frames_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while !received.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = socket.read(&mut chunk).await.expect("read");
            received.extend_from_slice(&chunk[..read]);
        }

        // First frame rides in the same write as the 101 response.
        let mut reply = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n".to_vec();
        reply.extend(encode_frame(
            &Frame::text("{\"method\":\"turn/started\",\"params\":{}}"),
            None,
        ));
        socket.write_all(&reply).await.expect("write");

        let mut reader = FrameReader::new();
        loop {
            if let Some(message) = reader.next_message().expect("frame") {
                return message;
            }
            let read = socket.read(&mut chunk).await.expect("read");
            reader.push(&chunk[..read]);
        }
    });

    let target = parse_endpoint(&format!("127.0.0.1:{port}")).expect("target");
    let mut stream = open_stream(&target, Duration::from_secs(2))
        .await
        .expect("open");
    let leftover = perform_handshake(&mut stream, &target)
        .await
        .expect("handshake");

    let mut reader = FrameReader::new();
    reader.push(&leftover);
    let first = reader.next_message().expect("decode").expect("first frame");
    let Message::Text(text) = first else {
        panic!("expected text frame");
    };
    assert_eq!(parse_incoming(&text).len(), 1);

    stream
        .write_all(&encode_client_frame(&Frame::text("{\"id\":1,\"result\":{}}")))
        .await
        .expect("send");

    let echoed = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server finished")
        .expect("join");
    assert_eq!(echoed, Message::Text("{\"id\":1,\"result\":{}}".to_string()));
}
