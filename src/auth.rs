//! User identity and login validation.
//!
//! Authentication is a two-step exchange on the wire: `u<name>` sets the
//! username, `p<password>` supplies the password. Passwords are compared
//! verbatim against the configured user table.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("there is no user name defined")]
    EmptyUsername,
    #[error("username can only contain letters, numbers or underscore")]
    InvalidUsername,
    #[error("there is no password defined")]
    EmptyPassword,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub password: String,
}

/// A valid username starts with an ASCII letter followed by letters,
/// digits or underscores.
pub fn validate_username(name: &str) -> Result<(), AuthError> {
    let mut bytes = name.bytes();
    match bytes.next() {
        None => return Err(AuthError::EmptyUsername),
        Some(first) if !first.is_ascii_alphabetic() => return Err(AuthError::InvalidUsername),
        Some(_) => {}
    }
    if bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Ok(())
    } else {
        Err(AuthError::InvalidUsername)
    }
}

/// Form a login candidate from a name and password.
pub fn get_user(name: &str, password: &str) -> Result<User, AuthError> {
    validate_username(name)?;
    if password.is_empty() {
        return Err(AuthError::EmptyPassword);
    }
    Ok(User {
        name: name.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_user() {
        let user = get_user("name", "pass").unwrap();
        assert_eq!(user.name, "name");
        assert_eq!(user.password, "pass");
    }

    #[test]
    fn rejects_empty_password() {
        assert_eq!(get_user("name", ""), Err(AuthError::EmptyPassword));
    }

    #[test]
    fn rejects_empty_username() {
        assert_eq!(get_user("", "pass"), Err(AuthError::EmptyUsername));
    }

    #[test]
    fn rejects_special_characters() {
        assert_eq!(get_user("?user", "pass"), Err(AuthError::InvalidUsername));
        assert_eq!(get_user("us er", "pass"), Err(AuthError::InvalidUsername));
    }

    #[test]
    fn rejects_leading_digit() {
        assert_eq!(get_user("2name3", "pass"), Err(AuthError::InvalidUsername));
    }

    #[test]
    fn accepts_letters_digits_and_underscore() {
        let user = get_user("name3_2abc", "pass").unwrap();
        assert_eq!(user.name, "name3_2abc");
    }
}
