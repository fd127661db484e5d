//! Token setup and liquidity checks run before a batch is proposed
//!
//! A token must be native on exactly one chain, and on each chain it must be
//! either native or mint/burn. The destination must be able to pay out the
//! batch's cumulative amount for the token.

use alloy::primitives::{Address, U256};
use eyre::Result;
use multichain_rs::{Direction, TransferBatch};
use std::sync::Arc;
use tracing::debug;

use crate::chain::{EvmChainClient, MxChainClient};
use crate::errors::RelayerError;

/// One token of a batch, as seen on both chains
#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenTotal {
    display: String,
    evm_token: Address,
    mx_token: Vec<u8>,
    amount: U256,
}

pub struct BalanceValidator {
    evm: Arc<dyn EvmChainClient>,
    mx: Arc<dyn MxChainClient>,
}

impl BalanceValidator {
    pub fn new(evm: Arc<dyn EvmChainClient>, mx: Arc<dyn MxChainClient>) -> Self {
        Self { evm, mx }
    }

    /// Check every token of a converted batch
    pub async fn check_batch(&self, direction: Direction, batch: &TransferBatch) -> Result<()> {
        for total in token_totals(direction, batch)? {
            self.check_token(direction, &total).await?;
        }
        Ok(())
    }

    async fn check_token(&self, direction: Direction, total: &TokenTotal) -> Result<()> {
        if !self.evm.is_token_whitelisted(total.evm_token).await? {
            return Err(RelayerError::InvalidSetup(format!(
                "token {} is not whitelisted on Ethereum",
                total.display
            ))
            .into());
        }

        let evm_native = self.evm.is_native_token(total.evm_token).await?;
        let evm_mint_burn = self.evm.is_mint_burn_token(total.evm_token).await?;
        let mx_native = self.mx.is_native_token(&total.mx_token).await?;
        let mx_mint_burn = self.mx.is_mint_burn_allowed(&total.mx_token).await?;

        if !evm_native && !evm_mint_burn {
            return Err(RelayerError::InvalidSetup(format!(
                "token {} is neither native nor mint/burn on Ethereum",
                total.display
            ))
            .into());
        }
        if !mx_native && !mx_mint_burn {
            return Err(RelayerError::InvalidSetup(format!(
                "token {} is neither native nor mint/burn on MultiversX",
                total.display
            ))
            .into());
        }
        if evm_native == mx_native {
            let which = if evm_native { "both chains" } else { "neither chain" };
            return Err(RelayerError::InvalidSetup(format!(
                "token {} is native on {}",
                total.display, which
            ))
            .into());
        }

        match direction {
            Direction::MxToEth if !evm_mint_burn => {
                let available = self.evm.total_balances(total.evm_token).await?;
                if available < total.amount {
                    return Err(RelayerError::BalanceMismatch {
                        token: total.display.clone(),
                        detail: format!(
                            "safe holds {}, batch needs {}",
                            available, total.amount
                        ),
                    }
                    .into());
                }
            }
            Direction::EthToMx if mx_native && mx_mint_burn => {
                let burned = self.mx.get_accumulated_burned_tokens(&total.mx_token).await?;
                if burned < total.amount {
                    return Err(RelayerError::BalanceMismatch {
                        token: total.display.clone(),
                        detail: format!(
                            "accumulated burned {}, batch needs {}",
                            burned, total.amount
                        ),
                    }
                    .into());
                }
            }
            _ => {}
        }

        debug!(
            token = %total.display,
            amount = %total.amount,
            evm_native,
            evm_mint_burn,
            mx_native,
            mx_mint_burn,
            "Token checks passed"
        );
        Ok(())
    }
}

/// Per-token sums in first-seen order
fn token_totals(direction: Direction, batch: &TransferBatch) -> Result<Vec<TokenTotal>> {
    let mut totals: Vec<TokenTotal> = Vec::new();
    for deposit in &batch.deposits {
        let (evm_bytes, mx_token) = match direction {
            Direction::EthToMx => (&deposit.token_bytes, &deposit.converted_token_bytes),
            Direction::MxToEth => (&deposit.converted_token_bytes, &deposit.token_bytes),
        };
        if evm_bytes.len() != 20 {
            return Err(RelayerError::InvalidSetup(format!(
                "deposit {} has a {} byte Ethereum token",
                deposit.nonce,
                evm_bytes.len()
            ))
            .into());
        }
        let evm_token = Address::from_slice(evm_bytes);

        match totals
            .iter_mut()
            .find(|t| t.evm_token == evm_token && &t.mx_token == mx_token)
        {
            Some(total) => total.amount = total.amount.saturating_add(deposit.amount),
            None => totals.push(TokenTotal {
                display: deposit.display_token.clone(),
                evm_token,
                mx_token: mx_token.clone(),
                amount: deposit.amount,
            }),
        }
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EvmToken, MockEvmChain, MockMxChain, MxToken};
    use multichain_rs::testing::MockDepositBuilder;

    const ERC20: [u8; 20] = [0xee; 20];
    const TOKEN_ID: &[u8] = b"WETH-abcdef";

    fn batch(direction: Direction, amounts: &[u64]) -> TransferBatch {
        let deposits = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                let builder = MockDepositBuilder::new(direction)
                    .nonce(i as u64 + 1)
                    .amount(*amount);
                match direction {
                    Direction::EthToMx => builder.tokens(ERC20.to_vec(), TOKEN_ID.to_vec()),
                    Direction::MxToEth => builder.tokens(TOKEN_ID.to_vec(), ERC20.to_vec()),
                }
                .build()
            })
            .collect();
        TransferBatch::new(1, deposits)
    }

    fn setup(evm: EvmToken, mx: MxToken) -> BalanceValidator {
        let evm_chain = MockEvmChain::new(vec![], 1);
        evm_chain.add_token(Address::from(ERC20), evm);
        let mx_chain = MockMxChain::new(vec![], 1);
        mx_chain.add_token(TOKEN_ID, ERC20.to_vec(), mx);
        BalanceValidator::new(
            evm_chain.client(Address::ZERO),
            mx_chain.client([0; 32]),
        )
    }

    fn setup_kind(err: eyre::Report) -> Option<crate::errors::ErrorKind> {
        err.downcast_ref::<RelayerError>().map(|e| e.kind())
    }

    #[tokio::test]
    async fn test_lock_unlock_on_evm_needs_safe_balance() {
        let validator = setup(
            EvmToken::native_locked(U256::from(100)),
            MxToken::mint_burn(U256::ZERO),
        );
        assert!(validator
            .check_batch(Direction::MxToEth, &batch(Direction::MxToEth, &[60, 40]))
            .await
            .is_ok());

        let err = validator
            .check_batch(Direction::MxToEth, &batch(Direction::MxToEth, &[60, 41]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayerError>(),
            Some(RelayerError::BalanceMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_mx_native_needs_accumulated_burn() {
        let validator = setup(
            EvmToken::mint_burn(),
            MxToken::native_mint_burn(U256::from(500)),
        );
        assert!(validator
            .check_batch(Direction::EthToMx, &batch(Direction::EthToMx, &[500]))
            .await
            .is_ok());
        assert!(validator
            .check_batch(Direction::EthToMx, &batch(Direction::EthToMx, &[501]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_native_on_both_chains_is_wrong_setup() {
        let validator = setup(
            EvmToken::native_locked(U256::from(1_000)),
            MxToken::native_mint_burn(U256::from(1_000)),
        );
        let err = validator
            .check_batch(Direction::EthToMx, &batch(Direction::EthToMx, &[1]))
            .await
            .unwrap_err();
        assert_eq!(setup_kind(err), Some(crate::errors::ErrorKind::WrongSetup));
    }

    #[tokio::test]
    async fn test_not_whitelisted_is_wrong_setup() {
        let mut token = EvmToken::native_locked(U256::from(1_000));
        token.whitelisted = false;
        let validator = setup(token, MxToken::mint_burn(U256::ZERO));
        let err = validator
            .check_batch(Direction::MxToEth, &batch(Direction::MxToEth, &[1]))
            .await
            .unwrap_err();
        assert_eq!(setup_kind(err), Some(crate::errors::ErrorKind::WrongSetup));
    }

    #[test]
    fn test_token_totals_group_by_pair() {
        let totals = token_totals(Direction::EthToMx, &batch(Direction::EthToMx, &[1, 2, 3])).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].amount, U256::from(6));
        assert_eq!(totals[0].mx_token, TOKEN_ID.to_vec());
    }
}
