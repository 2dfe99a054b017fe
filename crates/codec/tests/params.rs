use anyhow::Result;
use bytes::BytesMut;
use rdma_broker_codec::{ConnectionParams, Error, Psn};

#[test]
fn params_round_trip() -> Result<()> {
    let params = ConnectionParams {
        qp_num: 0x0004_01AB,
        lid: 0,
        gid: [
            0xFE, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x11, 0x22, 0xFF, 0xFE, 0x33,
            0x44, 0x55,
        ],
        psn: 0x0012_3457,
        rkey: 0xDEAD_BEEF,
        remote_addr: 0x0000_7F1A_2B3C_4000,
    };

    let mut bytes = BytesMut::with_capacity(ConnectionParams::WIRE_SIZE);
    params.encode(&mut bytes);

    assert_eq!(bytes.len(), ConnectionParams::WIRE_SIZE);
    assert_eq!(ConnectionParams::decode(&bytes[..])?, params);

    Ok(())
}

#[test]
fn params_fields_are_big_endian() {
    let params = ConnectionParams {
        qp_num: 0x0102_0304,
        lid: 0x0506,
        gid: [0xAA; 16],
        psn: 0x0000_0708,
        rkey: 0x090A_0B0C,
        remote_addr: 0x0D0E_0F10_1112_1314,
    };

    let mut bytes = BytesMut::new();
    params.encode(&mut bytes);

    assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[4..6], &[0x05, 0x06]);
    assert_eq!(&bytes[6..22], &[0xAA; 16]);
    assert_eq!(&bytes[22..26], &[0x00, 0x00, 0x07, 0x08]);
    assert_eq!(&bytes[26..30], &[0x09, 0x0A, 0x0B, 0x0C]);
    assert_eq!(
        &bytes[30..38],
        &[0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14]
    );
}

#[test]
fn params_reject_short_input() {
    let bytes = [0u8; ConnectionParams::WIRE_SIZE - 1];
    assert!(matches!(
        ConnectionParams::decode(&bytes),
        Err(Error::InvalidInput)
    ));
}

#[test]
fn params_reject_oversized_psn() {
    let params = ConnectionParams {
        qp_num: 1,
        lid: 1,
        gid: [0; 16],
        psn: 1,
        rkey: 1,
        remote_addr: 1,
    };

    let mut bytes = BytesMut::new();
    params.encode(&mut bytes);

    // Corrupt the high byte of the PSN field.
    bytes[22] = 0xFF;
    assert!(matches!(
        ConnectionParams::decode(&bytes[..]),
        Err(Error::PsnOutOfRange)
    ));
}

#[test]
fn psn_round_trip_and_bounds() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(Psn::WIRE_SIZE);

    for value in [1u32, 0x55, 0x00FF_FFFF] {
        Psn::new(value)?.encode(&mut bytes);
        assert_eq!(Psn::decode(&bytes[..])?.value(), value);
    }

    assert!(matches!(Psn::new(0), Err(Error::ZeroPsn)));
    assert!(matches!(Psn::new(0x0100_0000), Err(Error::PsnOutOfRange)));
    assert!(matches!(Psn::decode(&[0, 0, 0]), Err(Error::InvalidInput)));
    assert!(matches!(Psn::decode(&[0, 0, 0, 0]), Err(Error::ZeroPsn)));
    assert!(matches!(
        Psn::decode(&[1, 0, 0, 1]),
        Err(Error::PsnOutOfRange)
    ));

    Ok(())
}
