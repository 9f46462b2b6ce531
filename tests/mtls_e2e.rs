//! End-to-end mutual TLS over loopback TCP

mod common;

use std::io;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use workload_mtls::matcher::{match_any, match_exact, match_trust_domain};
use workload_mtls::mtls::{io_rejection_reason, peer_identity, tls_acceptor, tls_connector};
use workload_mtls::{Error, SpiffeId, TrustDomain};

use common::TestDomain;

const CLIENT_ID: &str = "spiffe://example.org/client";
const SERVER_ID: &str = "spiffe://example.org/server";

fn id(s: &str) -> SpiffeId {
    SpiffeId::parse(s).unwrap()
}

/// What each side saw of one connection attempt.
struct Outcome {
    /// Peer ID seen by the server, or its accept error
    server: io::Result<SpiffeId>,
    /// Peer ID seen by the client, or its connect/read error
    client: io::Result<SpiffeId>,
    /// DER of the leaf the server presented
    server_leaf: Option<Vec<u8>>,
}

async fn handshake(acceptor: TlsAcceptor, connector: TlsConnector) -> Outcome {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        let mut tls = acceptor.accept(tcp).await?;
        let peer = peer_identity(tls.get_ref().1).map_err(io::Error::other)?;
        tls.write_all(b"hello").await?;
        tls.shutdown().await?;
        Ok::<_, io::Error>(peer)
    });

    let mut server_leaf = None;
    let client = async {
        let tcp = TcpStream::connect(addr).await?;
        let server_name = ServerName::try_from("localhost").map_err(io::Error::other)?;
        let mut tls = connector.connect(server_name, tcp).await?;
        let (_, conn) = tls.get_ref();
        server_leaf = conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|leaf| leaf.as_ref().to_vec());
        let peer = peer_identity(conn).map_err(io::Error::other)?;

        // A server-side rejection arrives as an alert on the first read.
        let mut body = Vec::new();
        tls.read_to_end(&mut body).await?;
        assert_eq!(body, b"hello");
        Ok::<_, io::Error>(peer)
    }
    .await;

    let server = tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .unwrap()
        .unwrap();

    Outcome {
        server,
        client,
        server_leaf,
    }
}

fn server_rejection(outcome: &Outcome) -> &Error {
    let err = outcome.server.as_ref().unwrap_err();
    io_rejection_reason(err).unwrap_or_else(|| panic!("untyped server error: {err}"))
}

#[tokio::test]
async fn test_authorized_client_identity_reaches_server() {
    // GIVEN: client and server sources from the same trust domain
    let domain = TestDomain::new("example.org");
    let (_server_agent, server_source) = domain.workload("server", SERVER_ID).await;
    let (_client_agent, client_source) = domain.workload("client", CLIENT_ID).await;

    // WHEN: the server only admits the client and the client only trusts the server
    let server = tls_acceptor(server_source, match_exact(id(CLIENT_ID))).unwrap();
    let client = tls_connector(client_source, match_exact(id(SERVER_ID))).unwrap();
    let outcome = handshake(server, client).await;

    // THEN: both sides see exactly the other's SPIFFE ID
    assert_eq!(outcome.server.unwrap(), id(CLIENT_ID));
    assert_eq!(outcome.client.unwrap(), id(SERVER_ID));
}

#[tokio::test]
async fn test_unauthorized_client_is_rejected() {
    // GIVEN: a validly issued but unexpected client identity
    let domain = TestDomain::new("example.org");
    let (_server_agent, server_source) = domain.workload("server", SERVER_ID).await;
    let (_attacker_agent, attacker_source) = domain
        .workload("attacker", "spiffe://example.org/attacker")
        .await;

    let server = tls_acceptor(server_source, match_exact(id(CLIENT_ID))).unwrap();
    let client = tls_connector(attacker_source, match_exact(id(SERVER_ID))).unwrap();
    let outcome = handshake(server, client).await;

    // THEN: the server refuses with an authorization error and no data flows
    assert!(
        matches!(server_rejection(&outcome), Error::Authorization { id, .. } if id == "spiffe://example.org/attacker"),
        "{:?}",
        outcome.server
    );
    assert!(outcome.client.is_err());
}

#[tokio::test]
async fn test_client_rejects_unexpected_server() {
    let domain = TestDomain::new("example.org");
    let (_server_agent, server_source) = domain
        .workload("impostor", "spiffe://example.org/impostor")
        .await;
    let (_client_agent, client_source) = domain.workload("client", CLIENT_ID).await;

    let server = tls_acceptor(server_source, match_any()).unwrap();
    let client = tls_connector(client_source, match_exact(id(SERVER_ID))).unwrap();
    let outcome = handshake(server, client).await;

    let err = outcome.client.as_ref().unwrap_err();
    assert!(
        matches!(io_rejection_reason(err), Some(Error::Authorization { .. })),
        "{err}"
    );
    assert!(outcome.server.is_err());
}

#[tokio::test]
async fn test_foreign_trust_domain_is_rejected() {
    // GIVEN: a client from a trust domain the server holds no bundle for,
    // which itself trusts the server
    let domain = TestDomain::new("example.org");
    let foreign = TestDomain::new("other.org");
    let (_server_agent, server_source) = domain.workload("server", SERVER_ID).await;
    let (_client_agent, client_source) = foreign
        .workload_with_bundles("client", "spiffe://other.org/client", &[&foreign.ca, &domain.ca])
        .await;

    // WHEN: the server policy would admit anyone
    let server = tls_acceptor(server_source, match_any()).unwrap();
    let client = tls_connector(client_source, match_any()).unwrap();
    let outcome = handshake(server, client).await;

    // THEN: the client never gets as far as policy evaluation
    assert!(
        matches!(server_rejection(&outcome), Error::UnknownTrustDomain(td) if td == "other.org"),
        "{:?}",
        outcome.server
    );
}

#[tokio::test]
async fn test_forged_chain_for_known_trust_domain_is_rejected() {
    // GIVEN: a second CA that also claims example.org, issuing the client
    // while the client holds the genuine bundle
    let domain = TestDomain::new("example.org");
    let forger = TestDomain::new("example.org");
    let (_server_agent, server_source) = domain.workload("server", SERVER_ID).await;
    let (_client_agent, client_source) = forger
        .workload_with_bundles("client", CLIENT_ID, &[&domain.ca])
        .await;

    let server = tls_acceptor(server_source, match_exact(id(CLIENT_ID))).unwrap();
    let client = tls_connector(client_source, match_any()).unwrap();
    let outcome = handshake(server, client).await;

    // THEN: chain verification fails before the ID is trusted
    assert!(
        matches!(server_rejection(&outcome), Error::Tls(_)),
        "{:?}",
        outcome.server
    );
}

#[tokio::test]
async fn test_trust_domain_policy_admits_any_workload_in_domain() {
    let domain = TestDomain::new("example.org");
    let (_server_agent, server_source) = domain.workload("server", SERVER_ID).await;
    let (_client_agent, client_source) = domain
        .workload("batch", "spiffe://example.org/jobs/batch")
        .await;

    let policy = match_trust_domain(TrustDomain::new("example.org").unwrap());
    let server = tls_acceptor(server_source, policy).unwrap();
    let client = tls_connector(client_source, match_exact(id(SERVER_ID))).unwrap();
    let outcome = handshake(server, client).await;

    assert_eq!(outcome.server.unwrap(), id("spiffe://example.org/jobs/batch"));
}

#[tokio::test]
async fn test_rotation_applies_without_rebuilding_configs() {
    // GIVEN: configs built once over the server's source
    let domain = TestDomain::new("example.org");
    let (server_agent, server_source) = domain.workload("server", SERVER_ID).await;
    let (_client_agent, client_source) = domain.workload("client", CLIENT_ID).await;

    let server = tls_acceptor(server_source.clone(), match_any()).unwrap();
    let client = tls_connector(client_source, match_exact(id(SERVER_ID))).unwrap();

    let first = handshake(server.clone(), client.clone()).await;
    let first_leaf = first.server_leaf.unwrap();
    assert_eq!(first_leaf, server_source.current_document().unwrap().leaf().as_ref());

    // WHEN: the agent rotates the server's SVID
    let mut health = server_source.subscribe();
    server_agent.publish_context(&[domain.issue(SERVER_ID)], &[&domain.ca]);
    health.wait_for(|h| h.generation >= 2).await.unwrap();

    // THEN: the next handshake presents the new leaf
    let second = handshake(server, client).await;
    let second_leaf = second.server_leaf.unwrap();
    assert_ne!(first_leaf, second_leaf);
    assert_eq!(second_leaf, server_source.current_document().unwrap().leaf().as_ref());
    assert_eq!(second.server.unwrap(), id(CLIENT_ID));
}
