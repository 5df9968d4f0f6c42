use reqwest::StatusCode;

/// Whether `status` is a client or server error.
pub fn is_error_status(status: u16) -> bool {
    (400..600).contains(&status)
}

/// A human readable description of `status`, with friendlier wording for the
/// errors users run into most.
pub fn describe(status: StatusCode) -> String {
    let custom = match status.as_u16() {
        400 => Some("Your request path has malformed syntax or bad characters."),
        401 => Some("No permission -- Your session token is most likely invalid."),
        403 => Some("Request forbidden -- You cannot get this resource with or without a token."),
        404 => Some("No resource found at the given location."),
        405 => Some("Invalid method -- This method is not accepted for this resource."),
        406 => Some("Client does not support the given resource format."),
        _ => None,
    };

    match (custom, status.canonical_reason()) {
        (Some(text), _) => text.to_string(),
        (None, Some(reason)) => reason.to_string(),
        (None, None) => format!("HTTP status {}", status.as_u16()),
    }
}
