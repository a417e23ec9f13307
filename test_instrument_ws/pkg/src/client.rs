use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub attempt: u32,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {} failed", self.attempt)
    }
}

pub struct Client {
    pub fail_on: u32,
}

impl Client {
    pub fn new(fail_on: u32) -> Self {
        Self { fail_on }
    }

    pub fn do_request(&self, url: &str, attempt: u32) -> Result<String, Error> {
        if attempt == self.fail_on {
            return Err(Error { attempt });
        }
        Ok(format!("{} -> {}", url, crate::checksum(url.as_bytes())))
    }
}

#[allow(dead_code)]
fn legacy_send(url: &str) -> usize {
    url.len()
}
