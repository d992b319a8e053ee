use super::QueueError;

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 63;

/// Checks a queue name against the remote naming rules.
///
/// A valid name is 3 to 63 characters of lower-case ASCII letters, digits and
/// hyphens, starts and ends with a letter or digit, and has no consecutive
/// hyphens. Callers are expected to lower-case names first.
pub fn validate_queue_name(name: &str) -> Result<(), QueueError> {
   let invalid = |reason| {
      Err(QueueError::InvalidName {
         name: name.to_owned(),
         reason,
      })
   };

   if name.len() < MIN_LEN || name.len() > MAX_LEN {
      return invalid("must be between 3 and 63 characters long");
   }
   if let Some(c) = name
      .chars()
      .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
   {
      return match c {
         'A'..='Z' => invalid("must be lower case"),
         _ => invalid("may only contain letters, digits and hyphens"),
      };
   }
   if name.starts_with('-') || name.ends_with('-') {
      return invalid("must start and end with a letter or digit");
   }
   if name.contains("--") {
      return invalid("must not contain consecutive hyphens");
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   fn reason(name: &str) -> &'static str {
      match validate_queue_name(name) {
         Err(QueueError::InvalidName { reason, .. }) => reason,
         other => panic!("expected InvalidName for {name:?}, got {other:?}"),
      }
   }

   #[test]
   fn test_accepts_valid_names() {
      let longest = "q".repeat(63);
      for name in ["abc", "payments", "orders-eu-1", "123", longest.as_str()] {
         assert!(validate_queue_name(name).is_ok(), "{name} should be valid");
      }
   }

   #[test]
   fn test_rejects_bad_length() {
      assert_eq!(reason("ab"), "must be between 3 and 63 characters long");
      assert_eq!(
         reason(&"q".repeat(64)),
         "must be between 3 and 63 characters long"
      );
   }

   #[test]
   fn test_rejects_bad_characters() {
      assert_eq!(reason("Orders"), "must be lower case");
      assert_eq!(reason("orders_eu"), "may only contain letters, digits and hyphens");
      assert_eq!(reason("örders"), "may only contain letters, digits and hyphens");
   }

   #[test]
   fn test_rejects_bad_hyphens() {
      assert_eq!(reason("-orders"), "must start and end with a letter or digit");
      assert_eq!(reason("orders-"), "must start and end with a letter or digit");
      assert_eq!(reason("orders--eu"), "must not contain consecutive hyphens");
   }
}
