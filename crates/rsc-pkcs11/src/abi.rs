//! Conversions between the owned wire types and the caller's C buffers.
//!
//! Every function taking raw pointers is `unsafe`: the caller vouches that
//! non-null pointers are valid for the lengths the token interface pairs
//! them with.

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_INFO, CK_MECHANISM, CK_MECHANISM_INFO, CK_RV, CK_SESSION_INFO,
    CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_VERSION,
    CKR_ARGUMENTS_BAD, CKR_BUFFER_TOO_SMALL, CKR_OK,
};
use rsc_core::types::{host_len, host_value, pad_into, wire_len};
use rsc_core::{
    Attribute, AttributeRequest, AttributeValue, LibraryInfo, Mechanism, MechanismInfo,
    OutputBuffer, SessionInfo, SlotInfo, TokenInfo, Version,
};

fn version(version: Version) -> CK_VERSION {
    CK_VERSION {
        major: version.major,
        minor: version.minor,
    }
}

fn ulong(value: u64) -> CK_ULONG {
    value as CK_ULONG
}

fn optional(value: Option<u64>) -> CK_ULONG {
    value.map_or(CK_UNAVAILABLE_INFORMATION, ulong)
}

pub fn library_info(info: &LibraryInfo) -> CK_INFO {
    let mut out: CK_INFO = unsafe { std::mem::zeroed() };
    out.cryptokiVersion = version(info.cryptoki_version);
    pad_into(info.manufacturer.as_bytes(), &mut out.manufacturerID);
    out.flags = ulong(info.flags);
    pad_into(info.description.as_bytes(), &mut out.libraryDescription);
    out.libraryVersion = version(info.library_version);
    out
}

pub fn slot_info(info: &SlotInfo) -> CK_SLOT_INFO {
    let mut out: CK_SLOT_INFO = unsafe { std::mem::zeroed() };
    pad_into(info.description.as_bytes(), &mut out.slotDescription);
    pad_into(info.manufacturer.as_bytes(), &mut out.manufacturerID);
    out.flags = ulong(info.flags);
    out.hardwareVersion = version(info.hardware_version);
    out.firmwareVersion = version(info.firmware_version);
    out
}

pub fn token_info(info: &TokenInfo) -> CK_TOKEN_INFO {
    let mut out: CK_TOKEN_INFO = unsafe { std::mem::zeroed() };
    pad_into(info.label.as_bytes(), &mut out.label);
    pad_into(info.manufacturer.as_bytes(), &mut out.manufacturerID);
    pad_into(info.model.as_bytes(), &mut out.model);
    pad_into(info.serial_number.as_bytes(), &mut out.serialNumber);
    out.flags = ulong(info.flags);
    out.ulMaxSessionCount = optional(info.max_session_count);
    out.ulSessionCount = optional(info.session_count);
    out.ulMaxRwSessionCount = optional(info.max_rw_session_count);
    out.ulRwSessionCount = optional(info.rw_session_count);
    out.ulMaxPinLen = ulong(info.max_pin_len);
    out.ulMinPinLen = ulong(info.min_pin_len);
    out.ulTotalPublicMemory = optional(info.total_public_memory);
    out.ulFreePublicMemory = optional(info.free_public_memory);
    out.ulTotalPrivateMemory = optional(info.total_private_memory);
    out.ulFreePrivateMemory = optional(info.free_private_memory);
    out.hardwareVersion = version(info.hardware_version);
    out.firmwareVersion = version(info.firmware_version);
    pad_into(info.utc_time.as_bytes(), &mut out.utcTime);
    out
}

pub fn session_info(info: &SessionInfo) -> CK_SESSION_INFO {
    CK_SESSION_INFO {
        slotID: ulong(info.slot_id),
        state: ulong(info.state),
        flags: ulong(info.flags),
        ulDeviceError: ulong(info.device_error),
    }
}

pub fn mechanism_info(info: &MechanismInfo) -> CK_MECHANISM_INFO {
    CK_MECHANISM_INFO {
        ulMinKeySize: ulong(info.min_key_size),
        ulMaxKeySize: ulong(info.max_key_size),
        flags: ulong(info.flags),
    }
}

/// Writes `value` through `out`, rejecting a null destination.
pub unsafe fn write<T>(out: *mut T, value: T) -> CK_RV {
    if out.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    unsafe { out.write(value) };
    CKR_OK
}

/// Two-call list convention: a null `list` asks for the count only.
pub unsafe fn write_list<T: Copy>(items: &[T], list: *mut T, count: *mut CK_ULONG) -> CK_RV {
    if count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let available = unsafe { *count } as usize;
    unsafe { *count = items.len() as CK_ULONG };
    if list.is_null() {
        return CKR_OK;
    }
    if available < items.len() {
        return CKR_BUFFER_TOO_SMALL;
    }
    unsafe { std::ptr::copy_nonoverlapping(items.as_ptr(), list, items.len()) };
    CKR_OK
}

pub unsafe fn bytes<'a>(data: *const u8, len: CK_ULONG) -> Result<&'a [u8], CK_RV> {
    if len == 0 {
        return Ok(&[]);
    }
    if data.is_null() {
        return Err(CKR_ARGUMENTS_BAD);
    }
    Ok(unsafe { std::slice::from_raw_parts(data, len as usize) })
}

unsafe fn attributes<'a>(
    template: *const CK_ATTRIBUTE,
    count: CK_ULONG,
) -> Result<&'a [CK_ATTRIBUTE], CK_RV> {
    if count == 0 {
        return Ok(&[]);
    }
    if template.is_null() {
        return Err(CKR_ARGUMENTS_BAD);
    }
    Ok(unsafe { std::slice::from_raw_parts(template, count as usize) })
}

/// Copies a creation or search template into wire form.
pub unsafe fn template(
    template: *const CK_ATTRIBUTE,
    count: CK_ULONG,
) -> Result<Vec<Attribute>, CK_RV> {
    unsafe { attributes(template, count) }?
        .iter()
        .map(|attr| {
            let value = unsafe { bytes(attr.pValue as *const u8, attr.ulValueLen) }?;
            Ok(Attribute::from_host(attr.type_ as u64, value))
        })
        .collect()
}

/// Describes what the caller wants from each slot of a `GetAttributeValue`
/// template. Capacities are converted to wire lengths.
pub unsafe fn attribute_requests(
    template: *const CK_ATTRIBUTE,
    count: CK_ULONG,
) -> Result<Vec<AttributeRequest>, CK_RV> {
    Ok(unsafe { attributes(template, count) }?
        .iter()
        .map(|attr| {
            let kind = attr.type_ as u64;
            AttributeRequest {
                kind,
                capacity: (!attr.pValue.is_null()).then(|| wire_len(kind, attr.ulValueLen as u64)),
            }
        })
        .collect())
}

/// Copies the server's per-attribute outcomes back into the caller's
/// template. Slots the server could not fill report
/// `CK_UNAVAILABLE_INFORMATION`.
pub unsafe fn fill_attributes(
    template: *mut CK_ATTRIBUTE,
    count: CK_ULONG,
    values: &[AttributeValue],
) -> Result<(), CK_RV> {
    if count == 0 {
        return Ok(());
    }
    if template.is_null() {
        return Err(CKR_ARGUMENTS_BAD);
    }
    let slots = unsafe { std::slice::from_raw_parts_mut(template, count as usize) };
    for (slot, value) in slots.iter_mut().zip(values) {
        let kind = slot.type_ as u64;
        slot.ulValueLen = match (&value.value, value.len) {
            (Some(wire), _) if !slot.pValue.is_null() => {
                let host = host_value(kind, wire);
                if host.len() > slot.ulValueLen as usize {
                    CK_UNAVAILABLE_INFORMATION
                } else {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            host.as_ptr(),
                            slot.pValue as *mut u8,
                            host.len(),
                        )
                    };
                    host.len() as CK_ULONG
                }
            }
            (_, Some(len)) if slot.pValue.is_null() => ulong(host_len(kind, len)),
            _ => CK_UNAVAILABLE_INFORMATION,
        };
    }
    Ok(())
}

pub unsafe fn mechanism(mechanism: *const CK_MECHANISM) -> Result<Mechanism, CK_RV> {
    if mechanism.is_null() {
        return Err(CKR_ARGUMENTS_BAD);
    }
    let raw = unsafe { &*mechanism };
    let parameter = unsafe { bytes(raw.pParameter as *const u8, raw.ulParameterLen) }?;
    Ok(Mechanism {
        kind: raw.mechanism as u64,
        parameter: parameter.to_vec(),
    })
}

/// Capacity of an output buffer, or `None` for a length query.
pub unsafe fn capacity(out: *const u8, out_len: *const CK_ULONG) -> Result<Option<u64>, CK_RV> {
    if out_len.is_null() {
        return Err(CKR_ARGUMENTS_BAD);
    }
    if out.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { *out_len } as u64))
}

/// Two-call output convention: reports the required length, and copies the
/// data when the server produced it.
pub unsafe fn write_output(output: &OutputBuffer, out: *mut u8, out_len: *mut CK_ULONG) -> CK_RV {
    if out_len.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match &output.data {
        Some(data) if !out.is_null() => {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), out, data.len());
                *out_len = data.len() as CK_ULONG;
            }
            CKR_OK
        }
        _ => {
            unsafe { *out_len = ulong(output.required) };
            if out.is_null() {
                CKR_OK
            } else {
                CKR_BUFFER_TOO_SMALL
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CKA_CLASS, CKA_LABEL, CKO_SECRET_KEY};
    use rsc_core::InfoText;
    use rsc_core::types::ulong_bytes;

    #[test]
    fn list_convention_reports_count_then_fills() {
        let items: [CK_ULONG; 3] = [4, 5, 6];
        let mut count: CK_ULONG = 0;
        assert_eq!(
            unsafe { write_list(&items, std::ptr::null_mut(), &mut count) },
            CKR_OK
        );
        assert_eq!(count, 3);

        let mut short = [0 as CK_ULONG; 2];
        count = 2;
        assert_eq!(
            unsafe { write_list(&items, short.as_mut_ptr(), &mut count) },
            CKR_BUFFER_TOO_SMALL
        );
        assert_eq!(count, 3);

        let mut full = [0 as CK_ULONG; 3];
        assert_eq!(
            unsafe { write_list(&items, full.as_mut_ptr(), &mut count) },
            CKR_OK
        );
        assert_eq!(full, items);
    }

    #[test]
    fn output_convention_handles_query_and_short_buffers() {
        let mut len: CK_ULONG = 0;
        let query = OutputBuffer::length(32);
        assert_eq!(
            unsafe { write_output(&query, std::ptr::null_mut(), &mut len) },
            CKR_OK
        );
        assert_eq!(len, 32);

        let mut buf = [0u8; 4];
        len = 4;
        assert_eq!(
            unsafe { write_output(&query, buf.as_mut_ptr(), &mut len) },
            CKR_BUFFER_TOO_SMALL
        );
        assert_eq!(len, 32);

        let filled = OutputBuffer::filled(vec![9, 8]);
        assert_eq!(
            unsafe { write_output(&filled, buf.as_mut_ptr(), &mut len) },
            CKR_OK
        );
        assert_eq!(len, 2);
        assert_eq!(&buf[..2], &[9, 8]);
    }

    #[test]
    fn templates_convert_ulong_values_to_wire_form() {
        let class = ulong_bytes(CKO_SECRET_KEY);
        let label = b"key";
        let raw = [
            CK_ATTRIBUTE {
                type_: CKA_CLASS,
                pValue: class.as_ptr() as *mut _,
                ulValueLen: class.len() as CK_ULONG,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: label.as_ptr() as *mut _,
                ulValueLen: label.len() as CK_ULONG,
            },
        ];
        let attrs = unsafe { template(raw.as_ptr(), 2) }.expect("template");
        assert_eq!(attrs[0].value, (CKO_SECRET_KEY as u64).to_le_bytes());
        assert_eq!(attrs[1].value, b"key");

        assert_eq!(
            unsafe { template(std::ptr::null(), 1) },
            Err(CKR_ARGUMENTS_BAD)
        );
    }

    #[test]
    fn attribute_outcomes_fill_the_callers_template() {
        let mut class = [0u8; std::mem::size_of::<CK_ULONG>()];
        let mut raw = [
            CK_ATTRIBUTE {
                type_: CKA_CLASS,
                pValue: class.as_mut_ptr() as *mut _,
                ulValueLen: class.len() as CK_ULONG,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: std::ptr::null_mut(),
                ulValueLen: 0,
            },
        ];
        let requests = unsafe { attribute_requests(raw.as_ptr(), 2) }.expect("requests");
        assert_eq!(requests[0].capacity, Some(8));
        assert_eq!(requests[1].capacity, None);

        let values = [
            AttributeValue {
                kind: CKA_CLASS as u64,
                len: Some(8),
                value: Some((CKO_SECRET_KEY as u64).to_le_bytes().to_vec()),
            },
            AttributeValue {
                kind: CKA_LABEL as u64,
                len: Some(5),
                value: None,
            },
        ];
        unsafe { fill_attributes(raw.as_mut_ptr(), 2, &values) }.expect("fill");
        assert_eq!(raw[0].ulValueLen as usize, class.len());
        assert_eq!(class.to_vec(), ulong_bytes(CKO_SECRET_KEY));
        assert_eq!(raw[1].ulValueLen, 5);

        raw[1].pValue = class.as_mut_ptr() as *mut _;
        let missing = [values[0].clone(), AttributeValue::unavailable(CKA_LABEL as u64)];
        unsafe { fill_attributes(raw.as_mut_ptr(), 2, &missing) }.expect("fill");
        assert_eq!(raw[1].ulValueLen, CK_UNAVAILABLE_INFORMATION);
    }

    #[test]
    fn info_strings_are_blank_padded() {
        let info = library_info(&LibraryInfo {
            cryptoki_version: Version::new(2, 40),
            manufacturer: "SoftHSM".into(),
            flags: 0,
            description: "Implementation of PKCS11".into(),
            library_version: Version::new(2, 6),
        });
        assert_eq!(info.manufacturerID[7], b' ');
        assert_eq!(InfoText::from_field(&info.manufacturerID), "SoftHSM");
        assert_eq!(
            InfoText::from_field(&info.libraryDescription),
            "Implementation of PKCS11"
        );
        assert_eq!(info.cryptokiVersion.minor, 40);
    }
}
