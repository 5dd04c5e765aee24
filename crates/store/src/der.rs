//! Minimal DER plumbing to re-wrap legacy private keys (PKCS#1, SEC1) as PKCS#8.

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_EC_PARAMETERS: u8 = 0xa0;

// rsaEncryption (1.2.840.113549.1.1.1) followed by NULL parameters.
const RSA_ALGORITHM: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00];
// id-ecPublicKey (1.2.840.10045.2.1)
const EC_PUBLIC_KEY_OID: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const VERSION_ZERO: &[u8] = &[TAG_INTEGER, 0x01, 0x00];

fn push_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

pub(crate) fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 6);
    out.push(tag);
    push_len(&mut out, body.len());
    out.extend_from_slice(body);
    out
}

/// Split the first TLV off `input`: `(tag, contents, whole element, remainder)`.
pub(crate) fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n { return None; }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len { return None; }
    let header = input.len() - rest.len();
    Some((tag, &rest[..len], &input[..header + len], &rest[len..]))
}

fn private_key_info(algorithm: &[u8], key: &[u8]) -> Vec<u8> {
    let mut body = VERSION_ZERO.to_vec();
    body.extend(tlv(TAG_SEQUENCE, algorithm));
    body.extend(tlv(TAG_OCTET_STRING, key));
    tlv(TAG_SEQUENCE, &body)
}

/// `RSA PRIVATE KEY` → `PRIVATE KEY`.
pub fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> { private_key_info(RSA_ALGORITHM, pkcs1) }

/// `EC PRIVATE KEY` → `PRIVATE KEY`. The curve is taken from the key's own parameters field.
pub fn sec1_to_pkcs8(sec1: &[u8]) -> Option<Vec<u8>> {
    let (tag, mut body, _, _) = read_tlv(sec1)?;
    if tag != TAG_SEQUENCE { return None; }
    while !body.is_empty() {
        let (tag, contents, _, rest) = read_tlv(body)?;
        if tag == TAG_EC_PARAMETERS {
            let (inner, _, curve, _) = read_tlv(contents)?;
            if inner != TAG_OID { return None; }
            let mut algorithm = EC_PUBLIC_KEY_OID.to_vec();
            algorithm.extend_from_slice(curve);
            return Some(private_key_info(&algorithm, sec1));
        }
        body = rest;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // prime256v1 (1.2.840.10045.3.1.7)
    const P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

    #[test]
    fn long_lengths_round_trip() {
        let body = vec![0xab; 300];
        let enc = tlv(TAG_OCTET_STRING, &body);
        assert_eq!(&enc[..4], &[0x04, 0x82, 0x01, 0x2c]);
        let (tag, contents, whole, rest) = read_tlv(&enc).unwrap();
        assert_eq!(tag, TAG_OCTET_STRING);
        assert_eq!(contents, &body[..]);
        assert_eq!(whole.len(), enc.len());
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(read_tlv(&[0x30, 0x05, 0x00]).is_none());
        assert!(read_tlv(&[0x30]).is_none());
    }

    #[test]
    fn sec1_wraps_with_curve_from_parameters() {
        let mut body = vec![TAG_INTEGER, 0x01, 0x01];
        body.extend(tlv(TAG_OCTET_STRING, &[7u8; 32]));
        body.extend(tlv(TAG_EC_PARAMETERS, P256));
        let sec1 = tlv(TAG_SEQUENCE, &body);

        let p8 = sec1_to_pkcs8(&sec1).unwrap();
        let (_, outer, _, _) = read_tlv(&p8).unwrap();
        let (_, version, _, rest) = read_tlv(outer).unwrap();
        assert_eq!(version, &[0x00]);
        let (_, alg, _, rest) = read_tlv(rest).unwrap();
        assert_eq!(&alg[..EC_PUBLIC_KEY_OID.len()], EC_PUBLIC_KEY_OID);
        assert_eq!(&alg[EC_PUBLIC_KEY_OID.len()..], P256);
        let (tag, key, _, _) = read_tlv(rest).unwrap();
        assert_eq!(tag, TAG_OCTET_STRING);
        assert_eq!(key, &sec1[..]);
    }

    #[test]
    fn sec1_without_parameters_is_rejected() {
        let mut body = vec![TAG_INTEGER, 0x01, 0x01];
        body.extend(tlv(TAG_OCTET_STRING, &[7u8; 32]));
        assert!(sec1_to_pkcs8(&tlv(TAG_SEQUENCE, &body)).is_none());
    }
}
