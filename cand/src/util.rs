use futures::Future;
use std::fmt;

pub async fn catch_error<Fut, E>(future: Fut)
where
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display + fmt::Debug,
{
    if let Err(e) = future.await {
        log::error!("{}", e);
        log::debug!("Details: {:?}", e)
    }
}
