//! Starts a real node and authenticates against it over a loopback TCP
//! socket, exercising the full wiring (session manager, command service,
//! event bus) rather than mocking any of it.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use tunnox_proto::{AuthenticateBody, CommandPacket, CommandType, ResponseBody, TransferPacket};
use tunnox_server::{Server, ServerConfig};
use tunnox_stream::{PacketStream, Transformer};

#[tokio::test]
async fn fresh_node_authenticates_an_anonymous_client() {
    let listen = "127.0.0.1:58173".parse().unwrap();
    let bridge = "127.0.0.1:58174".parse().unwrap();
    let config = ServerConfig::single_node("node-under-test", listen, bridge);
    let server = Server::new(config);
    let scope = server.scope();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to bind before dialing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let socket = timeout(Duration::from_secs(2), TcpStream::connect(listen))
        .await
        .expect("dial should not hang")
        .expect("node should be accepting connections");
    let (read_half, write_half) = tokio::io::split(socket);
    let mut client = PacketStream::new(read_half, write_half, Transformer::identity());

    let auth = AuthenticateBody {
        auth_code: String::new(),
        secret_key: "anything".into(),
    };
    let command = CommandPacket::new(
        CommandType::Authenticate,
        uuid::Uuid::new_v4().to_string(),
        String::new(),
        0,
        0,
        serde_json::to_value(&auth).unwrap(),
    );
    client
        .write_packet(&TransferPacket::Command(command), true, None)
        .await
        .unwrap();

    let (packet, _) = timeout(Duration::from_secs(2), client.read_packet())
        .await
        .expect("response should arrive")
        .expect("read should succeed");
    let TransferPacket::Command(reply) = packet else {
        panic!("expected a command reply");
    };
    assert_eq!(reply.command_type, CommandType::Response);
    let response: ResponseBody = reply.decode_body().unwrap();
    assert!(response.success, "anonymous authentication should be accepted");

    scope.close().await;
}
