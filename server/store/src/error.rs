use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("user already exists")]
    UserExists,

    #[error("user does not exist")]
    NoSuchUser,

    #[error("password cannot be empty")]
    EmptyPassword,

    #[error("username cannot be empty")]
    EmptyUsername,

    #[error("telegram id already linked")]
    AlreadyLinked,
}
