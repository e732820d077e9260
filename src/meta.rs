//! NDT META test: the client describes itself to the server.

use tracing::debug;

use crate::coordinator::{Context, Step};
use crate::error::{NdtError, Result};
use crate::message::{Message, MessageType, TestKind};
use crate::results::StateChange;
use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForTestPrepare,
    WaitForTestStart,
    WaitForTestFinalize,
    Done,
}

pub(crate) struct MetaTest {
    state: State,
}

impl MetaTest {
    pub(crate) fn new() -> Self {
        MetaTest {
            state: State::WaitForTestPrepare,
        }
    }

    pub(crate) async fn handle<C: Connector>(
        &mut self,
        msg: &Message,
        ctx: &mut Context<'_, C>,
    ) -> Result<Step> {
        match (self.state, msg.kind) {
            (State::WaitForTestPrepare, MessageType::TestPrepare) => {
                ctx.notify(StateChange::Preparing(TestKind::Meta));
                self.state = State::WaitForTestStart;
            }
            (State::WaitForTestStart, MessageType::TestStart) => {
                ctx.notify(StateChange::Running(TestKind::Meta));
                let entry = ctx.config.meta_entry();
                debug!(entry, "sending client metadata");
                ctx.send(MessageType::TestMsg, &entry).await?;
                // an empty TEST_MSG ends the metadata list
                ctx.send(MessageType::TestMsg, "").await?;
                self.state = State::WaitForTestFinalize;
            }
            (State::WaitForTestFinalize, MessageType::TestFinalize) => {
                ctx.notify(StateChange::Finished(TestKind::Meta));
                self.state = State::Done;
                return Ok(Step::Done);
            }
            (state, kind) => {
                return Err(NdtError::violation(format!(
                    "META: unexpected message {kind} in state {state:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }
}
