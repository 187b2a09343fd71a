// Bytecode image container.
//
//   0..8   magic "RITE0300"
//   8..12  body length, u32 big-endian
//   12..   body
//
// The 8-byte magic is the interop contract: anything starting with it is
// treated as precompiled. The length field belongs to this VM.

use alloc::vec::Vec;

use super::{ErrorClass, ExecError};

pub const IMAGE_MAGIC: &[u8; 8] = b"RITE0300";
pub const HEADER_LEN: usize = 12;

pub fn is_image(bytes: &[u8]) -> bool {
    bytes.len() >= IMAGE_MAGIC.len() && bytes[..IMAGE_MAGIC.len()] == IMAGE_MAGIC[..]
}

pub fn build(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(IMAGE_MAGIC);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn body(image: &[u8]) -> Result<&[u8], ExecError> {
    if !is_image(image) {
        return Err(ExecError::new(ErrorClass::ImageError, "bad magic"));
    }
    let Some(len) = image.get(8..HEADER_LEN) else {
        return Err(ExecError::new(ErrorClass::ImageError, "truncated header"));
    };
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    // the length field is untrusted; on 32-bit targets it can overflow
    let end = HEADER_LEN.checked_add(len);
    match end.and_then(|end| image.get(HEADER_LEN..end)) {
        Some(body) => Ok(body),
        None => Err(ExecError::new(ErrorClass::ImageError, "truncated body")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_checked_byte_for_byte() {
        assert!(is_image(b"RITE0300"));
        assert!(is_image(b"RITE0300\0\0\0\0"));
        assert!(!is_image(b"RITE0200\0\0\0\0"));
        assert!(!is_image(b"rite0300"));
        assert!(!is_image(b"RITE"));
        assert!(!is_image(b"puts \"hi\""));
    }

    #[test]
    fn header_length_bounds_the_body() {
        let img = build(&[1, 2, 3]);
        assert_eq!(body(&img).unwrap(), &[1, 2, 3]);

        let mut trailing = img.clone();
        trailing.extend_from_slice(&[9, 9]);
        assert_eq!(body(&trailing).unwrap(), &[1, 2, 3]);

        let cut = &img[..img.len() - 1];
        assert_eq!(body(cut).unwrap_err().class, ErrorClass::ImageError);
        assert!(body(b"RITE0300").is_err());
    }

    #[test]
    fn absurd_length_field_is_an_image_error() {
        let img = b"RITE0300\xff\xff\xff\xff\x01\x00";
        let err = body(img).unwrap_err();
        assert_eq!(err.class, ErrorClass::ImageError);
        assert_eq!(err.message, "truncated body");
    }
}
