use anyhow::Result;
use codec::{ConnectionParams, Psn};
use rdma_broker::server::control::{self, ControlError};
use sdk::exchange;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn params(psn: u32, seed: u8) -> ConnectionParams {
    ConnectionParams {
        qp_num: 0x100 + seed as u32,
        lid: seed as u16,
        gid: [seed; 16],
        psn,
        rkey: 0xAB00 + seed as u32,
        remote_addr: 0x7000_0000 + seed as u64,
    }
}

#[tokio::test]
async fn bootstrap_exchange_round_trip() -> Result<()> {
    let (mut server_side, mut client_side) = tokio::io::duplex(256);

    let server_psn = Psn::new(0x00A5_0001)?;
    let client_psn = Psn::new(0x0011_2233)?;
    let server_params = params(server_psn.value(), 1);
    let client_params = params(client_psn.value(), 2);

    let server = tokio::spawn(async move {
        control::server_exchange(&mut server_side, &server_params, server_psn).await
    });

    let (seen_server_params, seen_server_psn) =
        exchange::client_exchange(&mut client_side, &client_params, client_psn).await?;

    let (seen_client_params, seen_client_psn) = server.await??;

    assert_eq!(seen_server_params, server_params);
    assert_eq!(seen_server_psn, server_psn);
    assert_eq!(seen_client_params, client_params);
    assert_eq!(seen_client_psn, client_psn);

    Ok(())
}

/// The record order is a protocol contract: PSN-handshake-1 from the
/// client, PSN-handshake-2 from the server, then Params-S before
/// Params-C. Script the server side by hand to pin the order down.
#[tokio::test]
async fn client_speaks_first_and_server_params_lead() -> Result<()> {
    let (mut scripted, mut client_side) = tokio::io::duplex(256);

    let server_psn = Psn::new(0x0000_0F0F)?;
    let client_psn = Psn::new(0x00C0_FFEE)?;
    let server_params = params(server_psn.value(), 3);
    let client_params = params(client_psn.value(), 4);

    let script = tokio::spawn(async move {
        // The client's PSN record must arrive before we say anything.
        let mut psn1 = [0u8; Psn::WIRE_SIZE];
        scripted.read_exact(&mut psn1).await?;

        scripted.write_all(&server_psn.value().to_be_bytes()).await?;

        let mut encoded = bytes::BytesMut::new();
        server_params.encode(&mut encoded);
        scripted.write_all(&encoded).await?;

        let mut params_c = [0u8; ConnectionParams::WIRE_SIZE];
        scripted.read_exact(&mut params_c).await?;

        anyhow::Ok((psn1, params_c))
    });

    let (seen_params, seen_psn) =
        exchange::client_exchange(&mut client_side, &client_params, client_psn).await?;

    assert_eq!(seen_params, server_params);
    assert_eq!(seen_psn, server_psn);

    let (psn1, params_c) = script.await??;
    assert_eq!(Psn::decode(&psn1)?, client_psn);
    assert_eq!(ConnectionParams::decode(&params_c)?, client_params);

    Ok(())
}

#[tokio::test]
async fn short_read_is_peer_closed() -> Result<()> {
    let (mut server_side, mut client_side) = tokio::io::duplex(64);

    let server_psn = Psn::new(0x0000_0101)?;
    let server_params = params(server_psn.value(), 5);

    // Two bytes of a four-byte PSN record, then EOF.
    client_side.write_all(&[0x00, 0x11]).await?;
    drop(client_side);

    let result = control::server_exchange(&mut server_side, &server_params, server_psn).await;
    assert!(matches!(result, Err(ControlError::PeerClosed)));

    Ok(())
}

#[tokio::test]
async fn malformed_psn_record_is_a_protocol_error() -> Result<()> {
    let (mut server_side, mut client_side) = tokio::io::duplex(64);

    let server_psn = Psn::new(0x0000_0101)?;
    let server_params = params(server_psn.value(), 6);

    // High byte set: not a legal 24-bit PSN.
    client_side.write_all(&[0xFF, 0x00, 0x00, 0x01]).await?;

    let result = control::server_exchange(&mut server_side, &server_params, server_psn).await;
    assert!(matches!(result, Err(ControlError::Codec(_))));

    Ok(())
}
