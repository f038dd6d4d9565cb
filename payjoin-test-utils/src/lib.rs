//! Fixtures shared by the payjoin-session unit and integration tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Mutex;

use bitcoin::Psbt;
use ohttp::hpke::{Aead, Kdf, Kem};
use ohttp::{KeyId, SymmetricSuite};
use once_cell::sync::{Lazy, OnceCell};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

pub type BoxError = Box<dyn std::error::Error + 'static>;
pub type BoxSendSyncError = Box<dyn std::error::Error + Send + Sync>;

static INIT_TRACING: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    INIT_TRACING.get_or_init(|| {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global default subscriber");
    });
}

pub static EXAMPLE_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://example.com").expect("invalid URL"));

pub static RELAY_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://relay.example").expect("invalid URL"));

pub const DUMMY20: [u8; 20] = [
    0x8e, 0x39, 0x8c, 0x52, 0x1b, 0x4f, 0xd4, 0x46, 0x3a, 0x96, 0x50, 0x15, 0x33, 0x2c, 0x09,
    0xc7, 0x6e, 0x3f, 0x11, 0xd1,
];

pub const DUMMY32: [u8; 32] = [
    0x0d, 0x6f, 0x43, 0x17, 0xa1, 0x25, 0x9b, 0x6e, 0x0e, 0x72, 0xd2, 0x58, 0x3c, 0x9a, 0xd8,
    0x8f, 0x40, 0x65, 0xc2, 0x21, 0x7a, 0x4a, 0x53, 0x01, 0x0e, 0x8c, 0xfc, 0xb8, 0x1b, 0xa4,
    0xd4, 0x57,
];

pub const KEY_ID: KeyId = 1;
pub const KEM: Kem = Kem::K256Sha256;
pub const SYMMETRIC: &[SymmetricSuite] =
    &[ohttp::SymmetricSuite::new(Kdf::HkdfSha256, Aead::ChaCha20Poly1305)];

/// A directory key configuration in its standard encoding.
pub const OHTTP_KEYS_HEX: &str = "01001604ba48c49c3d4a92a3ad00ecc63a024da10ced02180c73ec12d8a7ad2cc91bb483824fe2bee8d28bfe2eb2fc6453bc4d31cd851e8a6540e86c5382af588d370957000400010003";

// OriginalPSBT Test Vector from BIP 78
// | InputScriptType | Original PSBT Fee rate | maxadditionalfeecontribution | additionalfeeoutputindex|
// |-----------------|-----------------------|------------------------------|-------------------------|
// | P2SH-P2WPKH     |  2 sat/vbyte          | 0.00000182                   | 0                       |
pub const QUERY_PARAMS: &str = "maxadditionalfeecontribution=182&additionalfeeoutputindex=0";

/// From the BIP-78 test vector
pub const ORIGINAL_PSBT: &str = "cHNidP8BAHMCAAAAAY8nutGgJdyYGXWiBEb45Hoe9lWGbkxh/6bNiOJdCDuDAAAAAAD+////AtyVuAUAAAAAF6kUHehJ8GnSdBUOOv6ujXLrWmsJRDCHgIQeAAAAAAAXqRR3QJbbz0hnQ8IvQ0fptGn+votneofTAAAAAAEBIKgb1wUAAAAAF6kU3k4ekGHKWRNbA1rV5tR5kEVDVNCHAQcXFgAUx4pFclNVgo1WWAdN1SYNX8tphTABCGsCRzBEAiB8Q+A6dep+Rz92vhy26lT0AjZn4PRLi8Bf9qoB/CMk0wIgP/Rj2PWZ3gEjUkTlhDRNAQ0gXwTO7t9n+V14pZ6oljUBIQMVmsAaoNWHVMS02LfTSe0e388LNitPa1UQZyOihY+FFgABABYAFEb2Giu6c4KO5YW0pfw3lGp9jMUUAAA=";

/// From the BIP-78 test vector
pub const PAYJOIN_PROPOSAL: &str = "cHNidP8BAJwCAAAAAo8nutGgJdyYGXWiBEb45Hoe9lWGbkxh/6bNiOJdCDuDAAAAAAD+////jye60aAl3JgZdaIERvjkeh72VYZuTGH/ps2I4l0IO4MBAAAAAP7///8CJpW4BQAAAAAXqRQd6EnwadJ0FQ46/q6NcutaawlEMIcACT0AAAAAABepFHdAltvPSGdDwi9DR+m0af6+i2d6h9MAAAAAAQEgqBvXBQAAAAAXqRTeTh6QYcpZE1sDWtXm1HmQRUNU0IcAAQEggIQeAAAAAAAXqRTI8sv5ymFHLIjkZNRrNXSEXZHY1YcBBxcWABRfgGZV5ZJMkgTC1RvlOU9L+e2iEAEIawJHMEQCIGe7e0DfJaVPRYEKWxddL2Pr0G37BoKz0lyNa02O2/tWAiB7ZVgBoF4s8MHocYWWmo4Q1cyV2wl7MX0azlqa8NBENAEhAmXWPPW0G3yE3HajBOb7gO7iKzHSmZ0o0w0iONowcV+tAAAA";

/// Input contribution for the receiver, from the BIP78 test vector
pub const RECEIVER_INPUT_CONTRIBUTION: &str = "cHNidP8BAJwCAAAAAo8nutGgJdyYGXWiBEb45Hoe9lWGbkxh/6bNiOJdCDuDAAAAAAD+////jye60aAl3JgZdaIERvjkeh72VYZuTGH/ps2I4l0IO4MBAAAAAP7///8CJpW4BQAAAAAXqRQd6EnwadJ0FQ46/q6NcutaawlEMIcACT0AAAAAABepFHdAltvPSGdDwi9DR+m0af6+i2d6h9MAAAAAAAEBIICEHgAAAAAAF6kUyPLL+cphRyyI5GTUazV0hF2R2NWHAQcXFgAUX4BmVeWSTJIEwtUb5TlPS/ntohABCGsCRzBEAiBnu3tA3yWlT0WBClsXXS9j69Bt+waCs9JcjWtNjtv7VgIge2VYAaBeLPDB6HGFlpqOENXMldsJezF9Gs5amvDQRDQBIQJl1jz1tBt8hNx2owTm+4Du4isx0pmdKNMNIjjaMHFfrQAAAA==";

pub static PARSED_ORIGINAL_PSBT: Lazy<Psbt> =
    Lazy::new(|| Psbt::from_str(ORIGINAL_PSBT).expect("known psbt should parse"));

pub static PARSED_PAYJOIN_PROPOSAL: Lazy<Psbt> =
    Lazy::new(|| Psbt::from_str(PAYJOIN_PROPOSAL).expect("known psbt should parse"));

const ENCAPSULATED_MESSAGE_BYTES: usize = 8192;
const BHTTP_RES_BYTES: usize = ENCAPSULATED_MESSAGE_BYTES - 48;

/// An in-process stand-in for the relay and directory pair.
///
/// It opens OHTTP requests with its own key, serves `GET /{id}` and `POST /{id}` against an
/// in-memory mailbox map and seals padded responses, the way the real directory gateway does.
pub struct InMemoryDirectory {
    url: Url,
    encoded_keys: Vec<u8>,
    server: ohttp::Server,
    mailboxes: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        let config = ohttp::KeyConfig::new(KEY_ID, KEM, Vec::from(SYMMETRIC))
            .expect("valid key config");
        let encoded_keys = config.encode().expect("key config encodes");
        let server = ohttp::Server::new(config).expect("ohttp server");
        Self {
            url: Url::parse("https://directory.example/").expect("invalid URL"),
            encoded_keys,
            server,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn url(&self) -> Url { self.url.clone() }

    /// The key configuration a client would fetch from `/.well-known/ohttp-gateway`.
    pub fn ohttp_keys_encoded(&self) -> Vec<u8> { self.encoded_keys.clone() }

    /// Number of mailboxes holding a payload.
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.lock().expect("mailbox lock poisoned").len()
    }

    /// Answer one OHTTP request as the relay would have forwarded it.
    pub fn handle(&self, ohttp_req: &[u8]) -> Result<Vec<u8>, BoxError> {
        let (bhttp_req, res_ctx) = self.server.decapsulate(ohttp_req)?;
        let req = bhttp::Message::read_bhttp(&mut Cursor::new(bhttp_req))?;
        let method = req.control().method().unwrap_or_default().to_vec();
        let path = String::from_utf8(req.control().path().unwrap_or_default().to_vec())?;
        let id = path.trim_start_matches('/').to_owned();
        tracing::debug!("directory {} /{id}", String::from_utf8_lossy(&method));

        let mut mailboxes = self.mailboxes.lock().map_err(|_| "mailbox lock poisoned")?;
        let (status, body) = match method.as_slice() {
            b"POST" => {
                mailboxes.insert(id, req.content().to_vec());
                (200, Vec::new())
            }
            b"GET" => match mailboxes.get(&id) {
                Some(payload) => (200, payload.clone()),
                None => (202, Vec::new()),
            },
            _ => (404, Vec::new()),
        };
        drop(mailboxes);

        let mut bhttp_res = bhttp::Message::response(status);
        bhttp_res.write_content(&body);
        let mut bhttp_bytes = Vec::new();
        bhttp_res.write_bhttp(bhttp::Mode::KnownLength, &mut bhttp_bytes)?;
        bhttp_bytes.resize(BHTTP_RES_BYTES, 0);
        Ok(res_ctx.encapsulate(&bhttp_bytes)?)
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self { Self::new() }
}
