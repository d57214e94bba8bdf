use std::any::Any;

/// Extracts a human-readable message from a captured panic payload.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("job panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("job panicked: {message}");
    }
    "job panicked".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("oh no");
        assert_eq!(panic_message(&payload), "job panicked: oh no");

        let payload: Box<dyn Any + Send> = Box::new("worse".to_owned());
        assert_eq!(panic_message(&payload), "job panicked: worse");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&payload), "job panicked");
    }
}
