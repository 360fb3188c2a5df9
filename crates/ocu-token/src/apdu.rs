//! Short-form ISO 7816-4 command APDUs and status word handling.

use crate::error::TokenError;

/// Status word for a successful command.
pub const SW_SUCCESS: (u8, u8) = (0x90, 0x00);

/// A short command APDU (data field of at most 255 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Serialize to bytes: `CLA INS P1 P2 [Lc data] [Le]`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TokenError> {
        if self.data.len() > u8::MAX as usize {
            return Err(TokenError::MalformedInput(format!(
                "apdu data field too long: {} bytes",
                self.data.len()
            )));
        }

        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le);
        }
        Ok(out)
    }
}

/// Strip the trailing status word, failing on anything but `90 00`.
pub fn split_status(
    mut response: Vec<u8>,
    operation: &'static str,
) -> Result<Vec<u8>, TokenError> {
    if response.len() < 2 {
        return Err(TokenError::Io(format!(
            "{operation}: invalid response length {}",
            response.len()
        )));
    }

    let sw2 = response[response.len() - 1];
    let sw1 = response[response.len() - 2];
    if (sw1, sw2) != SW_SUCCESS {
        return Err(TokenError::Card { operation, sw1, sw2 });
    }

    response.truncate(response.len() - 2);
    Ok(response)
}
